// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coordination store client.
//!
//! The key updater only needs a single capability from the store: write a
//! value under a key with a TTL. [`KeyStore`] captures that seam and
//! [`EtcdClient`] implements it against the etcd v2 keys HTTP API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Identity, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use crate::config::StoreConfig;

const KEYS_PREFIX: [&str; 2] = ["v2", "keys"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    ReadTlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TLS material in {path}: {source}")]
    InvalidTls {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid etcd endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("no etcd endpoint configured")]
    NoEndpoints,
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("etcd responded with {status}: {message}")]
    Status { status: StatusCode, message: String },
}

impl StoreError {
    /// Whether the error happened while talking to the store, as opposed to
    /// while constructing the client.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Status { .. })
    }
}

/// A store able to hold a TTL-bound key.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value and resetting
    /// its expiry to `ttl` from now.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;
}

/// Body of a non-successful etcd v2 response.
#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: Option<u64>,
    message: Option<String>,
    cause: Option<String>,
}

/// etcd v2 keys API client with endpoint failover.
#[derive(Debug)]
pub struct EtcdClient {
    client: Client,
    endpoints: Vec<Url>,
    /// Index of the endpoint that answered last; Puts start there.
    preferred: AtomicUsize,
}

impl EtcdClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| parse_endpoint(endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(StoreError::NoEndpoints);
        }

        let mut builder = Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        if let Some(ca_file) = &config.tls.ca_file {
            let pem = read_tls_file(ca_file)?;
            let certificates =
                Certificate::from_pem_bundle(&pem).map_err(|source| StoreError::InvalidTls {
                    path: ca_file.clone(),
                    source,
                })?;
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        if let (Some(cert_file), Some(key_file)) = (&config.tls.cert_file, &config.tls.key_file) {
            let mut pem = read_tls_file(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_tls_file(key_file)?);
            let identity = Identity::from_pem(&pem).map_err(|source| StoreError::InvalidTls {
                path: cert_file.clone(),
                source,
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(StoreError::Client)?;
        Ok(Self {
            client,
            endpoints,
            preferred: AtomicUsize::new(0),
        })
    }

    async fn put_to(
        &self,
        endpoint: &Url,
        key: &str,
        body: &str,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .put(key_url(endpoint, key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.to_owned())
            .send()
            .await
    }
}

#[async_trait]
impl KeyStore for EtcdClient {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let body = form_body(value, ttl);
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = StoreError::NoEndpoints;

        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            match self.put_to(endpoint, key, &body).await {
                Ok(response) => {
                    if index != start {
                        debug!("etcd: switched to endpoint {endpoint}");
                    }
                    self.preferred.store(index, Ordering::Relaxed);
                    return check_response(response).await;
                }
                Err(source) => {
                    warn!("etcd: request to {endpoint} failed: {source}");
                    last_error = StoreError::Transport {
                        endpoint: endpoint.to_string(),
                        source,
                    };
                }
            }
        }
        Err(last_error)
    }
}

async fn check_response(response: Response) -> Result<(), StoreError> {
    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::CREATED {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<EtcdErrorBody>(&body) {
        Ok(EtcdErrorBody {
            error_code,
            message,
            cause,
        }) => {
            let mut text = message.unwrap_or_else(|| "unknown error".to_string());
            if let Some(code) = error_code {
                text = format!("{text} (code {code})");
            }
            if let Some(cause) = cause {
                text = format!("{text}: {cause}");
            }
            text
        }
        Err(_) => body,
    };
    Err(StoreError::Status { status, message })
}

fn parse_endpoint(endpoint: &str) -> Result<Url, StoreError> {
    let url = Url::parse(endpoint).map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(StoreError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(url)
}

/// `{endpoint}/v2/keys/{key}` with each key segment percent-encoded.
fn key_url(endpoint: &Url, key: &str) -> Url {
    let mut url = endpoint.clone();
    // endpoints are validated as http(s) base URLs
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(KEYS_PREFIX)
            .extend(key.split('/').filter(|segment| !segment.is_empty()));
    }
    url
}

/// `value=...&ttl=...`, with the payload bytes percent-encoded as they are.
fn form_body(value: &[u8], ttl: Duration) -> String {
    let value: String = form_urlencoded::byte_serialize(value).collect();
    format!("value={value}&ttl={}", ttl_seconds(ttl))
}

/// etcd TTLs are whole seconds; round up so the key never lives shorter than asked.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn read_tls_file(path: &Path) -> Result<Vec<u8>, StoreError> {
    std::fs::read(path).map_err(|source| StoreError::ReadTlsFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TlsFiles;
    use mockito::{Matcher, Server};

    fn store_config(endpoints: Vec<String>) -> StoreConfig {
        StoreConfig {
            endpoints,
            tls: TlsFiles::default(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_seconds(Duration::from_secs(10)), 10);
        assert_eq!(ttl_seconds(Duration::from_millis(10_001)), 11);
        assert_eq!(ttl_seconds(Duration::from_millis(200)), 1);
    }

    #[test]
    fn test_key_url_encodes_segments() {
        let endpoint = Url::parse("http://127.0.0.1:2379/").unwrap();
        assert_eq!(
            key_url(&endpoint, "/artifact-downloader/status").as_str(),
            "http://127.0.0.1:2379/v2/keys/artifact-downloader/status"
        );
        assert_eq!(
            key_url(&endpoint, "/jobs/with space").as_str(),
            "http://127.0.0.1:2379/v2/keys/jobs/with%20space"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let err = EtcdClient::new(&store_config(vec!["unix:/var/run/etcd".to_string()]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEndpoint(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_missing_ca_file_is_a_construction_error() {
        let mut config = store_config(vec!["https://127.0.0.1:2379".to_string()]);
        config.tls.ca_file = Some(PathBuf::from("/nonexistent/ca.pem"));
        let err = EtcdClient::new(&config).unwrap_err();
        assert!(matches!(err, StoreError::ReadTlsFile { .. }));
    }

    #[tokio::test]
    async fn test_put_sends_value_and_ttl() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v2/keys/artifact-downloader/status")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("value".into(), "running".into()),
                Matcher::UrlEncoded("ttl".into(), "10".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"action":"set","node":{"key":"/artifact-downloader/status","value":"running","ttl":10}}"#)
            .create_async()
            .await;

        let client = EtcdClient::new(&store_config(vec![server.url()])).unwrap();
        client
            .put(
                "/artifact-downloader/status",
                b"running",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_binary_payload_is_sent_unchanged() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v2/keys/status")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::Exact("value=%FF%FE%01&ttl=10".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let client = EtcdClient::new(&store_config(vec![server.url()])).unwrap();
        client
            .put("/status", &[0xFF, 0xFE, 0x01], Duration::from_secs(10))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_form_body_encoding() {
        assert_eq!(
            form_body(b"running", Duration::from_secs(10)),
            "value=running&ttl=10"
        );
        assert_eq!(
            form_body(b"a b&c=d", Duration::from_millis(1_500)),
            "value=a+b%26c%3Dd&ttl=2"
        );
    }

    #[tokio::test]
    async fn test_error_status_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v2/keys/status")
            .with_status(500)
            .with_body(r#"{"errorCode":300,"message":"Raft Internal Error","cause":"leader lost"}"#)
            .create_async()
            .await;

        let client = EtcdClient::new(&store_config(vec![server.url()])).unwrap();
        let err = client
            .put("/status", b"running", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        match err {
            StoreError::Status { status, message } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(message, "Raft Internal Error (code 300): leader lost");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fails_over_to_next_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v2/keys/status")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        // nothing listens on port 1
        let client = EtcdClient::new(&store_config(vec![
            "http://127.0.0.1:1".to_string(),
            server.url(),
        ]))
        .unwrap();
        client
            .put("/status", b"running", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(client.preferred.load(Ordering::Relaxed), 1);

        // the working endpoint is tried first from now on
        client
            .put("/status", b"degraded", Duration::from_secs(10))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_all_endpoints_down() {
        let client = EtcdClient::new(&store_config(vec!["http://127.0.0.1:1".to_string()]))
            .unwrap();
        let err = client
            .put("/status", b"running", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transport { .. }));
    }
}
