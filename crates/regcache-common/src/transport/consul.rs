//! Consul agent HTTP transport
//!
//! Implements [`RegistryClient`] against the local agent's `/v1/agent/*`
//! endpoints using a pooled hyper client.
//!
//! | operation | request |
//! |---|---|
//! | list | `GET /v1/agent/services` |
//! | register | `PUT /v1/agent/service/register` |
//! | deregister | `PUT /v1/agent/service/deregister/{id}` |
//! | health | `GET /v1/agent/health/service/name/{name}` |
//! | filtered list | `GET /v1/agent/services?filter=` |
//! | catalog services | `GET /v1/catalog/services` |
//! | catalog instances | `GET /v1/catalog/service/{name}?tag=` |
//!
//! The filtered and catalog queries are inherent methods; they are not part
//! of [`RegistryClient`].
//!
//! Only plain `http://` agents are supported.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::RegistryConfig;
use crate::protocol::error::{RegcacheError, Result};
use crate::protocol::{
    CatalogEntry, CatalogServices, HealthCheck, HealthStatus, Instance, InstanceHealth,
    InstanceId, ServiceHealth,
};
use crate::registry::RegistryClient;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Service entry as returned by `GET /v1/agent/services`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

impl From<AgentService> for Instance {
    fn from(svc: AgentService) -> Self {
        Instance {
            id: svc.id,
            service_name: svc.service,
            address: svc.address,
            port: svc.port,
            tags: svc.tags.unwrap_or_default().into_iter().collect(),
            meta: svc.meta.unwrap_or_default(),
            check: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    kind: &'a str,
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: Vec<&'a str>,
    meta: &'a BTreeMap<String, String>,
    port: u16,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    name: &'a str,
    status: &'a str,
    interval: String,
    timeout: String,
    #[serde(rename = "HTTP")]
    http: &'a str,
    deregister_critical_service_after: String,
}

impl<'a> AgentServiceCheck<'a> {
    fn from_check(check: &'a HealthCheck) -> Self {
        Self {
            check_id: &check.check_id,
            name: &check.name,
            status: "passing",
            interval: agent_duration(check.interval),
            timeout: agent_duration(check.timeout),
            http: &check.http,
            deregister_critical_service_after: agent_duration(check.deregister_after),
        }
    }
}

/// Entry of `GET /v1/agent/health/service/name/{name}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceChecksInfo {
    aggregated_status: String,
    service: AgentService,
}

/// Entry of `GET /v1/catalog/service/{name}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    node: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    datacenter: String,
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    service_meta: Option<BTreeMap<String, String>>,
}

impl From<CatalogService> for CatalogEntry {
    fn from(svc: CatalogService) -> Self {
        let address = if svc.service_address.is_empty() {
            svc.address.clone()
        } else {
            svc.service_address
        };
        CatalogEntry {
            node: svc.node,
            node_address: svc.address,
            datacenter: svc.datacenter,
            instance: Instance {
                id: svc.service_id,
                service_name: svc.service_name,
                address,
                port: svc.service_port,
                tags: svc.service_tags.unwrap_or_default().into_iter().collect(),
                meta: svc.service_meta.unwrap_or_default(),
                check: None,
            },
        }
    }
}

/// Formats a duration the way the agent parses it (`5s`, `1500ms`).
fn agent_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Registry client speaking the Consul agent HTTP API.
pub struct ConsulAgentClient {
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
    timeout: Duration,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl ConsulAgentClient {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            base_url: config.base_url(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            timeout: config.request_timeout,
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an endpoint URL, percent-encoding each path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                RegcacheError::Configuration(format!("registry address {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        if let Some(dc) = &self.datacenter {
            url.query_pairs_mut().append_pair("dc", dc);
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Option<Vec<u8>>) -> Result<(StatusCode, Bytes)> {
        let mut builder = Request::builder().method(method.clone()).uri(url.as_str());
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        debug!("{} {}", method, url.path());

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| RegcacheError::Timeout(self.timeout.as_millis() as u64))??;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RegcacheError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();

        Ok((status, bytes))
    }

    async fn fetch_services(&self, url: Url) -> Result<HashMap<InstanceId, Instance>> {
        let (status, body) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body));
        }

        let services: HashMap<String, AgentService> = serde_json::from_slice(&body)?;
        Ok(services
            .into_iter()
            .map(|(id, svc)| (id, Instance::from(svc)))
            .collect())
    }

    /// Local services matching an agent filter expression, e.g.
    /// `Service == "orders" and Meta.zone == "eu-1"`.
    pub async fn list_instances_filtered(&self, filter: &str) -> Result<HashMap<InstanceId, Instance>> {
        let mut url = self.endpoint(&["v1", "agent", "services"])?;
        url.query_pairs_mut().append_pair("filter", filter);
        self.fetch_services(url).await
    }

    /// Every service the catalog knows, with its tags.
    pub async fn catalog_services(&self) -> Result<CatalogServices> {
        let url = self.endpoint(&["v1", "catalog", "services"])?;
        let (status, body) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body));
        }

        let services: HashMap<String, Option<Vec<String>>> = serde_json::from_slice(&body)?;
        Ok(services
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect())
    }

    /// Catalog instances of `service_name`, optionally only those carrying
    /// `tag`. An unknown service yields an empty list.
    pub async fn catalog_service(&self, service_name: &str, tag: Option<&str>) -> Result<Vec<CatalogEntry>> {
        let mut url = self.endpoint(&["v1", "catalog", "service", service_name])?;
        if let Some(tag) = tag.filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("tag", tag);
        }
        let (status, body) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body));
        }

        let entries: Vec<CatalogService> = serde_json::from_slice(&body)?;
        Ok(entries.into_iter().map(CatalogEntry::from).collect())
    }

    fn status_error(status: StatusCode, body: &Bytes) -> RegcacheError {
        RegcacheError::Registry {
            status: status.as_u16(),
            message: String::from_utf8_lossy(body).trim().to_string(),
        }
    }
}

#[async_trait]
impl RegistryClient for ConsulAgentClient {
    async fn list_instances(&self) -> Result<HashMap<InstanceId, Instance>> {
        let url = self.endpoint(&["v1", "agent", "services"])?;
        self.fetch_services(url).await
    }

    async fn register(&self, instance: &Instance) -> Result<()> {
        let registration = AgentServiceRegistration {
            kind: "",
            id: &instance.id,
            name: &instance.service_name,
            tags: instance.tags.iter().map(String::as_str).collect(),
            meta: &instance.meta,
            port: instance.port,
            address: &instance.address,
            check: instance.check.as_ref().map(AgentServiceCheck::from_check),
        };
        let payload = serde_json::to_vec(&registration)?;

        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let (status, body) = self.send(Method::PUT, url, Some(payload)).await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body));
        }
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", instance_id])?;
        let (status, body) = self.send(Method::PUT, url, None).await?;
        if status.is_success() {
            return Ok(());
        }

        // Older agents answer 500 "Unknown service" instead of 404
        let unknown = status == StatusCode::NOT_FOUND
            || String::from_utf8_lossy(&body).contains("Unknown service");
        if unknown {
            return Err(RegcacheError::ServiceNotFound(instance_id.to_string()));
        }
        Err(Self::status_error(status, &body))
    }

    async fn lookup_health(&self, service_name: &str) -> Result<ServiceHealth> {
        let url = self.endpoint(&["v1", "agent", "health", "service", "name", service_name])?;
        let (status, body) = self.send(Method::GET, url, None).await?;

        let aggregated = match status {
            StatusCode::OK => HealthStatus::Passing,
            StatusCode::TOO_MANY_REQUESTS => HealthStatus::Warning,
            StatusCode::SERVICE_UNAVAILABLE => HealthStatus::Critical,
            StatusCode::NOT_FOUND => return Ok(ServiceHealth::unknown(service_name)),
            _ => return Err(Self::status_error(status, &body)),
        };

        let entries: Vec<AgentServiceChecksInfo> = if body.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&body)?
        };

        Ok(ServiceHealth {
            service_name: service_name.to_string(),
            status: aggregated,
            instances: entries
                .into_iter()
                .map(|entry| InstanceHealth {
                    instance_id: entry.service.id,
                    status: HealthStatus::parse(&entry.aggregated_status),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_duration() {
        assert_eq!(agent_duration(Duration::from_secs(5)), "5s");
        assert_eq!(agent_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_endpoint_encodes_instance_id() {
        let client = ConsulAgentClient::new(&RegistryConfig::default());
        let url = client
            .endpoint(&["v1", "agent", "service", "deregister", "orders#10.0.0.5:9090"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8500/v1/agent/service/deregister/orders%2310.0.0.5:9090"
        );
    }

    #[test]
    fn test_endpoint_appends_datacenter() {
        let config = RegistryConfig::default().with_datacenter("dc-master");
        let client = ConsulAgentClient::new(&config);
        let url = client.endpoint(&["v1", "agent", "services"]).unwrap();
        assert_eq!(url.query(), Some("dc=dc-master"));
    }

    #[test]
    fn test_registration_body_shape() {
        let mut meta = BTreeMap::new();
        meta.insert("zone".to_string(), "UNZONE".to_string());
        let instance = Instance::new("orders", "10.0.0.5", 9090)
            .with_meta(meta)
            .with_check(HealthCheck::new("orders#10.0.0.5:9090", "orders", "http://10.0.0.5:31000/ping"));

        let registration = AgentServiceRegistration {
            kind: "",
            id: &instance.id,
            name: &instance.service_name,
            tags: instance.tags.iter().map(String::as_str).collect(),
            meta: &instance.meta,
            port: instance.port,
            address: &instance.address,
            check: instance.check.as_ref().map(AgentServiceCheck::from_check),
        };
        let value = serde_json::to_value(&registration).unwrap();

        assert_eq!(value["ID"], json!("orders#10.0.0.5:9090"));
        assert_eq!(value["Name"], json!("orders"));
        assert_eq!(value["Port"], json!(9090));
        assert_eq!(value["Tags"], json!(["UNZONE"]));
        assert_eq!(value["Check"]["CheckID"], json!("orders#10.0.0.5:9090#check"));
        assert_eq!(value["Check"]["Interval"], json!("5s"));
        assert_eq!(value["Check"]["Timeout"], json!("3s"));
        assert_eq!(value["Check"]["DeregisterCriticalServiceAfter"], json!("30s"));
        assert_eq!(value["Check"]["HTTP"], json!("http://10.0.0.5:31000/ping"));
    }

    #[test]
    fn test_agent_service_null_tags() {
        let svc: AgentService = serde_json::from_value(json!({
            "ID": "a#h:1",
            "Service": "a",
            "Tags": null,
            "Meta": null,
            "Address": "h",
            "Port": 1
        }))
        .unwrap();
        let instance = Instance::from(svc);
        assert!(instance.tags.is_empty());
        assert!(instance.meta.is_empty());
        assert_eq!(instance.endpoint(), "h:1");
    }

    #[test]
    fn test_catalog_entry_address_fallback() {
        let svc: CatalogService = serde_json::from_value(json!({
            "ID": "b3f1",
            "Node": "node-1",
            "Address": "10.0.0.9",
            "Datacenter": "dc-master",
            "ServiceID": "orders#10.0.0.5:9090",
            "ServiceName": "orders",
            "ServiceAddress": "",
            "ServicePort": 9090,
            "ServiceTags": null,
            "ServiceMeta": {"zone": "eu-1"}
        }))
        .unwrap();
        let entry = CatalogEntry::from(svc);
        assert_eq!(entry.node, "node-1");
        assert_eq!(entry.endpoint(), "10.0.0.9:9090");
        assert_eq!(entry.instance.zone(), Some("eu-1"));
        assert!(entry.instance.tags.is_empty());
    }
}
