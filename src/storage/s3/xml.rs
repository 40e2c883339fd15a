// S3 XML wire documents

use serde::Deserialize;

use crate::storage::{BackendError, BackendResult};

#[derive(Debug, Deserialize)]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListBucketResult {
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListEntry>,
    #[serde(rename = "CommonPrefixes", default)]
    pub common_prefixes: Vec<CommonPrefix>,
}

#[derive(Debug, Deserialize)]
pub struct ListEntry {
    #[serde(rename = "Key")]
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct CommonPrefix {
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

pub fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> BackendResult<T> {
    quick_xml::de::from_str(body)
        .map_err(|e| BackendError::permanent(format!("Malformed storage response: {}", e)))
}

/// Error code/message from an S3 error body, if parseable.
pub fn parse_error(body: &str) -> Option<(String, String)> {
    quick_xml::de::from_str::<ErrorResponse>(body)
        .ok()
        .map(|e| (e.code, e.message))
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Payload of a CompleteMultipartUpload request. Parts must be given in
/// ascending part-number order.
pub fn complete_multipart_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number,
            escape_text(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Payload of a DeleteObjects request.
pub fn bulk_delete_body(keys: &[String]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str(&format!("<Object><Key>{}</Key></Object>", escape_text(key)));
    }
    body.push_str("</Delete>");
    body
}
