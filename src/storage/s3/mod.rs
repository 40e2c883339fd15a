// S3-compatible object-store backend
// Plain REST client with SigV4 signing and path-style addressing. No
// internal retrying; connection-level failures are classified as
// transient and handled by the storage engine.

pub mod sign;
pub mod xml;

use std::collections::{BTreeMap, HashMap};
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::StorageConfig;

use self::sign::SigV4Signer;

use super::{BackendError, BackendFactory, BackendResult, StorageBackend};

pub struct S3Backend {
    client: Client,
    signer: SigV4Signer,
    endpoint: String,
    host_header: String,
    bucket: String,
    uploads: Mutex<HashMap<String, BTreeMap<u32, String>>>,
}

impl S3Backend {
    fn new(config: &StorageConfig, ca_bundle: &[PathBuf], proxy: Option<String>) -> BackendResult<Self> {
        let endpoint = config.credentials.endpoint_url.trim_end_matches('/').to_string();
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| BackendError::permanent(format!("Invalid endpoint URL: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| BackendError::permanent("Endpoint URL has no host"))?;
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls);

        for ca_path in ca_bundle {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| BackendError::permanent(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| BackendError::permanent(format!("Invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::transient(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            signer: SigV4Signer::new(
                &config.credentials.access_key_id,
                &config.credentials.secret_access_key,
                &config.credentials.region,
            ),
            endpoint,
            host_header,
            bucket: config.credentials.bucket.clone(),
            uploads: Mutex::new(HashMap::new()),
        })
    }

    fn canonical_uri(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            self.bucket,
            sign::uri_encode(key.trim_start_matches('/'), true)
        )
    }

    fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        extra_headers: &[(&str, String)],
    ) -> BackendResult<reqwest::blocking::Response> {
        let canonical_uri = self.canonical_uri(key);
        let query_string = sign::canonical_query(query);
        let content_hash = sign::payload_hash(&body);
        let signed = self.signer.sign(
            method.as_str(),
            &canonical_uri,
            &query_string,
            &self.host_header,
            &content_hash,
            crate::util::now(),
        );

        let url = if query_string.is_empty() {
            format!("{}{}", self.endpoint, canonical_uri)
        } else {
            format!("{}{}?{}", self.endpoint, canonical_uri, query_string)
        };

        let mut request = self
            .client
            .request(method, &url)
            .header("x-amz-date", signed.amz_date.as_str())
            .header("x-amz-content-sha256", content_hash.as_str())
            .header("authorization", signed.authorization.as_str());
        for (name, value) in extra_headers {
            request = request.header(*name, value.as_str());
        }
        request
            .body(body)
            .send()
            .map_err(|e| BackendError::transient(format!("Request failed: {}", e)))
    }

    fn check_status(op: &str, key: &str, response: reqwest::blocking::Response) -> BackendResult<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        let detail = xml::parse_error(&body)
            .map(|(code, message)| format!("{}: {}", code, message))
            .unwrap_or_else(|| body.chars().take(200).collect());
        let message = format!("{} {} failed with {}: {}", op, key, status, detail);

        Err(match status.as_u16() {
            404 => BackendError::not_found(message),
            405 | 501 => BackendError::unsupported(message),
            429 | 500..=599 => BackendError::transient(message),
            _ => BackendError::permanent(message),
        })
    }
}

impl StorageBackend for S3Backend {
    fn put(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let response = self.request(reqwest::Method::PUT, key, &[], data.to_vec(), &[])?;
        Self::check_status("put", key, response).map(|_| ())
    }

    fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        let response = self.request(reqwest::Method::GET, key, &[], Vec::new(), &[])?;
        let response = Self::check_status("get", key, response)?;
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| BackendError::transient(format!("Failed to read body: {}", e)))
    }

    fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let response = self.request(
            reqwest::Method::GET,
            key,
            &[],
            Vec::new(),
            &[("range", range)],
        )?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        let response = Self::check_status("get_range", key, response)?;
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| BackendError::transient(format!("Failed to read body: {}", e)))
    }

    fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<String>> {
        let prefix = format!("{}/", prefix.trim_matches('/'));
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.clone()),
            ];
            if !recursive {
                query.push(("delimiter".to_string(), "/".to_string()));
            }
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.request(reqwest::Method::GET, "", &query, Vec::new(), &[])?;
            let response = Self::check_status("list", &prefix, response)?;
            let body = response
                .text()
                .map_err(|e| BackendError::transient(format!("Failed to read body: {}", e)))?;
            let result: xml::ListBucketResult = xml::parse(&body)?;

            keys.extend(result.contents.into_iter().map(|e| e.key));
            keys.extend(result.common_prefixes.into_iter().map(|p| p.prefix));

            if result.is_truncated {
                continuation = result.next_continuation_token;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        let response = self.request(reqwest::Method::HEAD, key, &[], Vec::new(), &[])?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Self::check_status("exists", key, response).map(|_| true),
        }
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        let response = self.request(reqwest::Method::DELETE, key, &[], Vec::new(), &[])?;
        match Self::check_status("delete", key, response) {
            Ok(_) => Ok(()),
            // Deleting a missing key is not an error.
            Err(e) if e.kind == super::BackendErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delete_many(&self, keys: &[String]) -> BackendResult<()> {
        let body = xml::bulk_delete_body(keys).into_bytes();
        let content_md5 = BASE64.encode(md5::compute(&body).0);
        let query = vec![("delete".to_string(), String::new())];
        let response = self.request(
            reqwest::Method::POST,
            "",
            &query,
            body,
            &[("content-md5", content_md5)],
        )?;
        Self::check_status("delete_many", "<bulk>", response).map(|_| ())
    }

    fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let response = self.request(reqwest::Method::POST, key, &query, Vec::new(), &[])?;
        let response = Self::check_status("create_multipart_upload", key, response)?;
        let body = response
            .text()
            .map_err(|e| BackendError::transient(format!("Failed to read body: {}", e)))?;
        let result: xml::InitiateMultipartUploadResult = xml::parse(&body)?;

        self.uploads
            .lock()
            .insert(result.upload_id.clone(), BTreeMap::new());
        debug!(key, upload_id = %result.upload_id, "Created multipart upload");
        Ok(result.upload_id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<()> {
        let query = vec![
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        let response = self.request(reqwest::Method::PUT, key, &query, data.to_vec(), &[])?;
        let response = Self::check_status("upload_part", key, response)?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut uploads = self.uploads.lock();
        let parts = uploads.get_mut(upload_id).ok_or_else(|| {
            BackendError::permanent(format!("No such multipart upload: {}", upload_id))
        })?;
        parts.insert(part_number, etag);
        Ok(())
    }

    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        // BTreeMap iteration yields part numbers in ascending order.
        let parts: Vec<(u32, String)> = {
            let uploads = self.uploads.lock();
            uploads
                .get(upload_id)
                .ok_or_else(|| {
                    BackendError::permanent(format!("No such multipart upload: {}", upload_id))
                })?
                .iter()
                .map(|(n, etag)| (*n, etag.clone()))
                .collect()
        };

        let body = xml::complete_multipart_body(&parts).into_bytes();
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let response = self.request(reqwest::Method::POST, key, &query, body, &[])?;
        Self::check_status("complete_multipart_upload", key, response)?;

        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let response = self.request(reqwest::Method::DELETE, key, &query, Vec::new(), &[])?;
        self.uploads.lock().remove(upload_id);
        match Self::check_status("abort_multipart_upload", key, response) {
            Ok(_) => Ok(()),
            Err(e) if e.kind == super::BackendErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct S3BackendFactory {
    config: StorageConfig,
    ca_bundle: Vec<PathBuf>,
}

impl S3BackendFactory {
    pub fn new(config: StorageConfig, ca_bundle: Vec<PathBuf>) -> Self {
        Self { config, ca_bundle }
    }

    /// Ask the proxy resolver for a proxy host. The returned hostname
    /// must resolve in DNS; unresolvable answers are retried.
    fn resolve_proxy(&self) -> BackendResult<Option<String>> {
        let uri = match &self.config.proxy_resolver.uri {
            Some(uri) => uri.clone(),
            None => return Ok(None),
        };
        let port = self.config.proxy_resolver.proxy_port.unwrap_or(80);

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .build()
            .map_err(|e| BackendError::transient(format!("Failed to build HTTP client: {}", e)))?;

        let mut last_error = String::new();
        for _attempt in 0..self.config.max_attempts.max(1) {
            match client.get(&uri).send().and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    let host = response
                        .text()
                        .map_err(|e| BackendError::transient(format!("Proxy resolver: {}", e)))?
                        .trim()
                        .to_string();
                    if (host.as_str(), 0u16).to_socket_addrs().is_ok() {
                        return Ok(Some(format!("http://{}:{}", host, port)));
                    }
                    last_error = format!("Proxy resolver returned unknown hostname: {}", host);
                    warn!("{}", last_error);
                }
                Err(e) => {
                    last_error = format!("Proxy resolver request failed: {}", e);
                    warn!("{}", last_error);
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(BackendError::transient(last_error))
    }
}

impl BackendFactory for S3BackendFactory {
    fn create(&self) -> BackendResult<Arc<dyn StorageBackend>> {
        let proxy = self.resolve_proxy()?;
        Ok(Arc::new(S3Backend::new(
            &self.config,
            &self.ca_bundle,
            proxy,
        )?))
    }
}
