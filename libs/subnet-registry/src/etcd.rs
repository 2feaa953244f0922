//! etcd v2 keys API client over HTTP(S).
//!
//! Wraps `reqwest` with optional mutual TLS. Requests walk the configured
//! endpoints in order and move on to the next one when a connection cannot
//! be established; any other failure is reported for the current endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Identity, Method};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EtcdConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::models::{RawResponse, Response};
use crate::store::{Connector, KvStore};

/// Timeout for establishing a TCP/TLS connection to a member. Requests
/// themselves have no deadline since watches are long-polls.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

type Params<'a> = [(&'a str, String)];

/// HTTP client for one etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl EtcdClient {
    /// Build a client, with a client certificate and/or private CA when the
    /// configuration names any.
    pub fn new(config: &EtcdConfig) -> RegistryResult<Self> {
        config
            .validate()
            .map_err(|e| RegistryError::ClientConstruction(e.to_string()))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT);

        if config.uses_tls() {
            if let (Some(cert), Some(key)) = (&config.certfile, &config.keyfile) {
                let mut pem = read_pem(cert)?;
                pem.extend(read_pem(key)?);
                let identity = Identity::from_pem(&pem).map_err(|e| {
                    RegistryError::ClientConstruction(format!(
                        "invalid client certificate '{}' or key '{}': {e}",
                        cert.display(),
                        key.display()
                    ))
                })?;
                builder = builder.identity(identity);
            }
            if let Some(ca) = config.ca_file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
                let root = Certificate::from_pem(&read_pem(ca)?).map_err(|e| {
                    RegistryError::ClientConstruction(format!(
                        "invalid CA certificate '{}': {e}",
                        ca.display()
                    ))
                })?;
                builder = builder.add_root_certificate(root);
            }
        }

        let http = builder
            .build()
            .map_err(|e| RegistryError::ClientConstruction(format!("http client: {e}")))?;

        Ok(Self {
            http,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_owned())
                .collect(),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &Params<'_>,
        form: Option<&Params<'_>>,
    ) -> RegistryResult<RawResponse> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{endpoint}/v2/keys{key}");
            let mut req = self.http.request(method.clone(), &url).query(query);
            if let Some(form) = form {
                req = req.form(form);
            }
            match req.send().await {
                Ok(resp) => return read_raw(resp, &method, key).await,
                Err(err) if err.is_connect() => {
                    warn!(%endpoint, key, error = %err, "etcd member unreachable, trying next");
                    last_err = Some(err);
                }
                Err(err) => {
                    return Err(RegistryError::Transport(format!(
                        "{method} '{key}' against {endpoint} failed: {err}"
                    )));
                }
            }
        }
        Err(RegistryError::Transport(match last_err {
            Some(err) => format!("{method} '{key}': no etcd member reachable: {err}"),
            None => format!("{method} '{key}': no etcd endpoints configured"),
        }))
    }

    async fn send_decoded(
        &self,
        method: Method,
        key: &str,
        query: &Params<'_>,
        form: Option<&Params<'_>>,
    ) -> RegistryResult<Response> {
        self.send(method, key, query, form).await?.unmarshal()
    }
}

fn read_pem(path: &std::path::Path) -> RegistryResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        RegistryError::ClientConstruction(format!("failed to read '{}': {e}", path.display()))
    })
}

fn ttl_param(params: &mut Vec<(&str, String)>, ttl: u64) {
    if ttl > 0 {
        params.push(("ttl", ttl.to_string()));
    }
}

async fn read_raw(
    resp: reqwest::Response,
    method: &Method,
    key: &str,
) -> RegistryResult<RawResponse> {
    let status_code = resp.status().as_u16();
    let etcd_index = resp
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    let body = resp.bytes().await.map_err(|e| {
        RegistryError::Transport(format!("{method} '{key}': failed reading body: {e}"))
    })?;
    debug!(%method, key, status_code, etcd_index, len = body.len(), "etcd response");
    Ok(RawResponse {
        status_code,
        body,
        etcd_index,
    })
}

#[async_trait]
impl KvStore for EtcdClient {
    async fn get(&self, key: &str, sorted: bool, recursive: bool) -> RegistryResult<Response> {
        let query = [
            ("recursive", recursive.to_string()),
            ("sorted", sorted.to_string()),
        ];
        self.send_decoded(Method::GET, key, &query, None).await
    }

    async fn set_dir(&self, key: &str, ttl: u64) -> RegistryResult<Response> {
        let mut form = vec![("dir", "true".to_owned())];
        ttl_param(&mut form, ttl);
        self.send_decoded(Method::PUT, key, &[], Some(form.as_slice())).await
    }

    async fn create(&self, key: &str, value: &str, ttl: u64) -> RegistryResult<Response> {
        let mut form = vec![("value", value.to_owned()), ("prevExist", "false".to_owned())];
        ttl_param(&mut form, ttl);
        self.send_decoded(Method::PUT, key, &[], Some(form.as_slice())).await
    }

    async fn update(&self, key: &str, value: &str, ttl: u64) -> RegistryResult<Response> {
        let mut form = vec![("value", value.to_owned()), ("prevExist", "true".to_owned())];
        ttl_param(&mut form, ttl);
        self.send_decoded(Method::PUT, key, &[], Some(form.as_slice())).await
    }

    async fn delete(&self, key: &str, recursive: bool) -> RegistryResult<Response> {
        let query = [("recursive", recursive.to_string())];
        self.send_decoded(Method::DELETE, key, &query, None).await
    }

    async fn raw_watch(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
        stop: &CancellationToken,
    ) -> RegistryResult<RawResponse> {
        let mut query = vec![
            ("wait", "true".to_owned()),
            ("recursive", recursive.to_string()),
        ];
        if wait_index > 0 {
            query.push(("waitIndex", wait_index.to_string()));
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(RegistryError::WatchStopped),
            resp = self.send(Method::GET, key, &query, None) => resp,
        }
    }

    async fn sync_cluster(&self) -> bool {
        for endpoint in &self.endpoints {
            let url = format!("{endpoint}/v2/members");
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%endpoint, "etcd member healthy");
                    return true;
                }
                Ok(resp) => warn!(%endpoint, status = %resp.status(), "etcd member unhealthy"),
                Err(err) => warn!(%endpoint, error = %err, "etcd member unreachable"),
            }
        }
        false
    }
}

/// Connector producing [`EtcdClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

impl Connector for EtcdConnector {
    type Store = EtcdClient;

    fn connect(&self, config: &EtcdConfig) -> RegistryResult<EtcdClient> {
        EtcdClient::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> EtcdConfig {
        // port 1 is never an etcd member, connections are refused immediately
        EtcdConfig {
            endpoints: vec!["http://127.0.0.1:1/".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_client() {
        let client = EtcdClient::new(&unreachable_config()).unwrap();
        assert_eq!(client.endpoints(), ["http://127.0.0.1:1"]);
    }

    #[test]
    fn test_tls_client_missing_cert_is_construction_failure() {
        let config = EtcdConfig {
            certfile: Some("/nonexistent/client.crt".into()),
            keyfile: Some("/nonexistent/client.key".into()),
            ..Default::default()
        };
        let err = EtcdClient::new(&config).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(err.to_string().contains("/nonexistent/client.crt"));
    }

    #[test]
    fn test_invalid_config_is_construction_failure() {
        let config = EtcdConfig {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(matches!(
            EtcdClient::new(&config),
            Err(RegistryError::ClientConstruction(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_member_is_transport_error() {
        let client = EtcdConnector.connect(&unreachable_config()).unwrap();
        let err = client.get("/registry/minions", true, false).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(err.to_string().contains("/registry/minions"));
        assert!(!client.sync_cluster().await);
    }

    #[tokio::test]
    async fn test_watch_stops_when_cancelled() {
        let client = EtcdClient::new(&unreachable_config()).unwrap();
        let stop = CancellationToken::new();
        stop.cancel();
        let err = client
            .raw_watch("/registry/subnets", 0, true, &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::WatchStopped));
    }
}
