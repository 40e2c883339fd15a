// # RustyBackup CLI
//
// Thin command-line front end for the backup engine: backup, restore,
// delete, purge, list, show, version.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use tracing::error;

use rusty_backup::config::Config;
use rusty_backup::control::http::HttpDatabaseControl;
use rusty_backup::error::{BackupError, Result};
use rusty_backup::metadata::BackupState;
use rusty_backup::{BackupEngine, BackupOptions, BackupSources, RestoreOptions, VERSION};

const USAGE: &str = "\
Usage: rusty-backup [--config <path>] <command> [options]

Commands:
  backup   [--name <name>] [--databases a,b] [--tables db.t,...]
           [--schema-only] [--force] [--label key=value]
  restore  <name> [--databases a,b] [--schema-only] [--keep-going]
           [--force-non-replicated] [--override-replica-name <name>]
           [--cloud-storage-source-bucket <bucket>]
           [--cloud-storage-source-path <path>]
           [--cloud-storage-source-endpoint <url>] [--skip-cloud-storage]
  restore-access-control <name>
  delete   <name> [--purge-partial]
  purge
  list     [--state <state>]
  show     <name>
  version
";

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(()) => {}
        Err(e) => {
            error!("{}", e);
            exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(e: &BackupError) -> i32 {
    e.exit_code()
}

struct Arguments {
    positional: Vec<String>,
    flags: Vec<String>,
    options: HashMap<String, String>,
}

impl Arguments {
    fn parse(args: &[String]) -> Result<Self> {
        let mut positional = Vec::new();
        let mut flags = Vec::new();
        let mut options = HashMap::new();

        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if let Some(name) = arg.strip_prefix("--") {
                if let Some((key, value)) = name.split_once('=') {
                    options.insert(key.to_string(), value.to_string());
                } else if i + 1 < args.len() && !args[i + 1].starts_with("--") {
                    options.insert(name.to_string(), args[i + 1].clone());
                    i += 1;
                } else {
                    flags.push(name.to_string());
                }
            } else {
                positional.push(arg.clone());
            }
            i += 1;
        }
        Ok(Self {
            positional,
            flags,
            options,
        })
    }

    fn flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }

    fn option(&self, name: &str) -> Option<&String> {
        self.options.get(name)
    }

    fn list_option(&self, name: &str) -> Option<Vec<String>> {
        self.option(name)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
    }
}

fn run(args: Vec<String>) -> Result<()> {
    let arguments = Arguments::parse(&args)?;
    let command = match arguments.positional.first() {
        Some(command) => command.clone(),
        None => {
            print!("{}", USAGE);
            return Ok(());
        }
    };

    if command == "version" {
        println!("{}", VERSION);
        return Ok(());
    }

    let config_path = arguments
        .option("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/rusty-backup/config.json"));
    let config = Config::load(&config_path)?;
    let lock_exitcode = config.lock.exitcode;

    let control = Arc::new(HttpDatabaseControl::new(&config.database)?);
    let engine = BackupEngine::new(config, control, None)?;

    let result = dispatch(&engine, &command, &arguments);
    if let Err(BackupError::Lock(e)) = &result {
        error!("{}", e);
        exit(lock_exitcode);
    }
    result
}

fn dispatch(engine: &BackupEngine, command: &str, args: &Arguments) -> Result<()> {
    match command {
        "backup" => {
            let schema_only = args.flag("schema-only");
            let mut labels = HashMap::new();
            if let Some(label) = args.option("label") {
                if let Some((key, value)) = label.split_once('=') {
                    labels.insert(key.to_string(), value.to_string());
                }
            }
            let options = BackupOptions {
                name: args
                    .option("name")
                    .cloned()
                    .unwrap_or_else(default_backup_name),
                databases: args.list_option("databases"),
                tables: args.list_option("tables").unwrap_or_default(),
                force: args.flag("force"),
                labels,
            };
            let sources = BackupSources::for_backup(schema_only, args.flag("access-control"));

            let (name, msg) = engine.backup(sources, options)?;
            if let Some(msg) = msg {
                println!("{} ({})", name, msg);
            } else {
                println!("{}", name);
            }
            Ok(())
        }
        "restore" => {
            let name = required_positional(args, "restore")?;
            let options = RestoreOptions {
                databases: args.list_option("databases"),
                schema_only: args.flag("schema-only"),
                override_replica_name: args.option("override-replica-name").cloned(),
                force_non_replicated: args.flag("force-non-replicated"),
                cloud_storage_source_bucket: args.option("cloud-storage-source-bucket").cloned(),
                cloud_storage_source_path: args.option("cloud-storage-source-path").cloned(),
                cloud_storage_source_endpoint: args
                    .option("cloud-storage-source-endpoint")
                    .cloned(),
                skip_cloud_storage: args.flag("skip-cloud-storage"),
                keep_going: args.flag("keep-going"),
            };
            engine.restore(&name, options)
        }
        "restore-access-control" => {
            let name = required_positional(args, "restore-access-control")?;
            engine.restore_access_control(&name)
        }
        "delete" => {
            let name = required_positional(args, "delete")?;
            let (deleted, msg) = engine.delete(&name, args.flag("purge-partial"))?;
            if let Some(deleted) = deleted {
                println!("{}", deleted);
            }
            if let Some(msg) = msg {
                println!("{}", msg);
            }
            Ok(())
        }
        "purge" => {
            let (deleted, msg) = engine.purge()?;
            for name in deleted {
                println!("{}", name);
            }
            if let Some(msg) = msg {
                println!("{}", msg);
            }
            Ok(())
        }
        "list" => {
            let state = match args.option("state") {
                Some(value) => Some(parse_state(value)?),
                None => None,
            };
            for backup in engine.list(state)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    backup.name,
                    backup.state(),
                    backup.start_time.format("%Y-%m-%d %H:%M:%S"),
                    backup.size,
                    backup.real_size,
                );
            }
            Ok(())
        }
        "show" => {
            let name = required_positional(args, "show")?;
            let backup = engine.get(&name)?;
            println!("{}", backup.dump_json(false));
            Ok(())
        }
        _ => {
            print!("{}", USAGE);
            Err(BackupError::Configuration(format!(
                "Unknown command: {}",
                command
            )))
        }
    }
}

fn required_positional(args: &Arguments, command: &str) -> Result<String> {
    args.positional
        .get(1)
        .cloned()
        .ok_or_else(|| BackupError::Configuration(format!("{} requires a backup name", command)))
}

fn parse_state(value: &str) -> Result<BackupState> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| BackupError::Configuration(format!("Unknown backup state: {}", value)))
}

fn default_backup_name() -> String {
    rusty_backup::util::now().format("%Y%m%dT%H%M%S").to_string()
}
