// Create-statement classification and rewriting

use regex::Regex;

pub fn is_merge_tree(engine: &str) -> bool {
    engine.contains("MergeTree")
}

pub fn is_replicated(engine: &str) -> bool {
    engine.contains("Replicated")
}

pub fn is_distributed(engine: &str) -> bool {
    engine == "Distributed"
}

pub fn is_view(engine: &str) -> bool {
    matches!(engine, "View" | "LiveView" | "MaterializedView")
}

pub fn is_materialized_view(engine: &str) -> bool {
    engine == "MaterializedView"
}

pub fn is_dictionary(engine: &str) -> bool {
    engine == "Dictionary"
}

/// Engines integrating with external systems; their data is not part
/// of the backup.
pub fn is_external_engine(engine: &str) -> bool {
    matches!(
        engine,
        "HDFS"
            | "JDBC"
            | "Kafka"
            | "MongoDB"
            | "MySQL"
            | "ODBC"
            | "PostgreSQL"
            | "RabbitMQ"
            | "S3"
            | "URL"
    )
}

/// Convert a CREATE statement to an ATTACH one.
pub fn to_attach_query(create_query: &str) -> String {
    let re = Regex::new(r"^\s*CREATE").expect("static regex");
    re.replace(create_query, "ATTACH").to_string()
}

/// Parse the engine name out of a create statement.
pub fn engine_from_statement(statement: &str) -> Option<String> {
    let re = Regex::new(r"(?i)Engine\s*=\s*(?P<engine>[^\s(]+)").expect("static regex");
    re.captures(statement)
        .map(|c| c.name("engine").expect("named group").as_str().to_string())
}

/// Rewrite a table create statement according to restore options.
///
/// `force_non_replicated` strips the Replicated engine prefix and its
/// first two constructor arguments; `override_replica_name` replaces
/// the replica argument; `uuid` injects an explicit object id when the
/// statement lacks one.
pub fn rewrite_table_schema(
    create_statement: &str,
    engine: &str,
    force_non_replicated: bool,
    override_replica_name: Option<&str>,
    uuid: Option<&str>,
) -> (String, String) {
    let mut statement = create_statement.to_string();
    let mut engine = engine.to_string();

    if force_non_replicated {
        let re = Regex::new(
            r"(?P<replicated>Replicated)\S{0,20}MergeTree\((?P<params>('[^']+',\s*'[^']+'(,\s*|))|)",
        )
        .expect("static regex");
        if let Some(captures) = re.captures(&statement) {
            let params = captures.name("params").expect("named group").as_str();
            if !params.is_empty() {
                statement = statement.replace(params, "");
                statement = statement.replacen("Replicated", "", 1);
                statement = statement.replace("MergeTree()", "MergeTree");
            }
            if is_replicated(&engine) {
                engine = engine.replacen("Replicated", "", 1);
            }
        }
    }

    if let Some(replica_name) = override_replica_name {
        let re = Regex::new(r"Replicated\S{0,20}MergeTree\('[^']+',\s*(?P<replica>'\S+')")
            .expect("static regex");
        if let Some(captures) = re.captures(&statement) {
            let replica = captures.name("replica").expect("named group").as_str().to_string();
            statement = statement.replace(&replica, &format!("'{}'", replica_name));
        }
    }

    if let Some(uuid) = uuid {
        if !statement.contains("UUID") {
            let re = Regex::new(
                r"(?P<head>^\s*(?:CREATE|ATTACH)\s+(?:MATERIALIZED\s+)?(?:TABLE|VIEW)\s+\S+)",
            )
            .expect("static regex");
            if let Some(captures) = re.captures(&statement) {
                let head = captures.name("head").expect("named group").as_str().to_string();
                statement = statement.replacen(&head, &format!("{} UUID '{}'", head, uuid), 1);
            }
        }
    }

    (statement, engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_attach_query() {
        assert_eq!(
            to_attach_query("CREATE TABLE db.t (a Int32) ENGINE = MergeTree ORDER BY a"),
            "ATTACH TABLE db.t (a Int32) ENGINE = MergeTree ORDER BY a"
        );
    }

    #[test]
    fn test_engine_from_statement() {
        assert_eq!(
            engine_from_statement("CREATE TABLE t (a Int32) ENGINE = MergeTree ORDER BY a"),
            Some("MergeTree".to_string())
        );
        assert_eq!(
            engine_from_statement(
                "CREATE TABLE t (a Int32) ENGINE = ReplicatedMergeTree('/path', 'r1') ORDER BY a"
            ),
            Some("ReplicatedMergeTree".to_string())
        );
        assert_eq!(engine_from_statement("SELECT 1"), None);
    }

    #[test]
    fn test_force_non_replicated_strips_engine_args() {
        let statement =
            "CREATE TABLE db.t (a Int32) ENGINE = ReplicatedMergeTree('/tables/t', 'replica-1') ORDER BY a";
        let (rewritten, engine) = rewrite_table_schema(
            statement,
            "ReplicatedMergeTree",
            true,
            None,
            None,
        );
        assert_eq!(engine, "MergeTree");
        assert!(!rewritten.contains("Replicated"));
        assert!(!rewritten.contains("/tables/t"));
        assert!(rewritten.contains("ENGINE = MergeTree ORDER BY a"));
    }

    #[test]
    fn test_override_replica_name() {
        let statement =
            "CREATE TABLE db.t (a Int32) ENGINE = ReplicatedMergeTree('/tables/t', 'old-replica') ORDER BY a";
        let (rewritten, engine) = rewrite_table_schema(
            statement,
            "ReplicatedMergeTree",
            false,
            Some("{replica}"),
            None,
        );
        assert_eq!(engine, "ReplicatedMergeTree");
        assert!(rewritten.contains("'{replica}'"));
        assert!(!rewritten.contains("old-replica"));
    }

    #[test]
    fn test_uuid_injection() {
        let statement = "CREATE TABLE db.t (a Int32) ENGINE = MergeTree ORDER BY a";
        let (rewritten, _) = rewrite_table_schema(
            statement,
            "MergeTree",
            false,
            None,
            Some("123e4567-e89b-12d3-a456-426614174000"),
        );
        assert!(rewritten
            .starts_with("CREATE TABLE db.t UUID '123e4567-e89b-12d3-a456-426614174000' (a Int32)"));
    }

    #[test]
    fn test_uuid_not_duplicated() {
        let statement = "CREATE TABLE db.t UUID 'abc' (a Int32) ENGINE = MergeTree ORDER BY a";
        let (rewritten, _) = rewrite_table_schema(statement, "MergeTree", false, None, Some("xyz"));
        assert_eq!(rewritten, statement);
    }
}
