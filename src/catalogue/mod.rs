use std::collections::HashMap;
use std::env;
use std::time::Duration;

use log::{debug, error, info};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;

use crate::app::{App, Source, VipService};
use crate::error::Error;

const NODE_ENV: &str = "CONSUL_NODE";
const TOKEN_ENV: &str = "CONSUL_TOKEN";
const STALE_ENV: &str = "CONSUL_STALE";

const MATCH_TAG: &str = "enable_gocast";
const VIP_TAG: &str = "gocast_vip";
const COMMUNITIES_TAG: &str = "gocast_vip_communities";
const MONITOR_TAG: &str = "gocast_monitor";
const NAT_TAG: &str = "gocast_nat";
const VIP_SERVICE_TAG: &str = "gocast_consul_vip_service";
const VIP_CHECK_TAG: &str = "gocast_consul_vip_check";

const TOKEN_HEADER: &str = "X-Consul-Token";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CHECK_INTERVAL: &str = "15s";
const CHECK_TIMEOUT: &str = "2s";
const DEREGISTER_AFTER: &str = "10m";

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceEntry {
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeServices {
    #[serde(rename = "Services", default)]
    services: HashMap<String, ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct AgentCheck {
    #[serde(rename = "ServiceName", default)]
    service_name: String,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Node", default)]
    node: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// HTTP client against a Consul-compatible service catalogue
pub struct CatalogueClient {
    addr: String,
    token: Option<String>,
    node: String,
    stale: bool,
    client: Client,
}

impl CatalogueClient {
    /// `addr` is the catalogue base URL (including any API prefix). The
    /// node name comes from $CONSUL_NODE, falling back to the hostname;
    /// the token from $CONSUL_TOKEN (priority) or config.
    pub fn new(addr: &str, config_token: &str) -> Result<Self, Error> {
        let node = match env::var(NODE_ENV) {
            Ok(node) if !node.is_empty() => node,
            _ => hostname::get()
                .map_err(|err| Error::Catalogue(format!("cannot determine hostname: {}", err)))?
                .to_string_lossy()
                .into_owned(),
        };
        let token = match env::var(TOKEN_ENV) {
            Ok(token) if !token.is_empty() => Some(token),
            _ if !config_token.is_empty() => Some(config_token.to_string()),
            _ => None,
        };
        let stale = env::var(STALE_ENV).map(|v| v == "true").unwrap_or(false);
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        info!("Using catalogue at {} for node {}", addr, node);
        Ok(CatalogueClient {
            addr: addr.trim_end_matches('/').to_string(),
            token,
            node,
            stale,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.addr, path));
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        req
    }

    fn uses_local_agent(&self) -> bool {
        self.addr.contains("localhost") || self.addr.contains("127.0.0.1")
    }

    /// List this node's tagged services as app definitions
    pub async fn query_services(&self) -> Result<Vec<App>, Error> {
        let mut path = format!("/catalog/node/{}", self.node);
        if self.stale {
            path.push_str("?stale");
        }
        let data: NodeServices = self
            .request(Method::GET, &path)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(apps_from_services(data.services.into_values()))
    }

    /// A service is healthy iff this node's check status is "passing"
    pub async fn health_check(&self, service: &str) -> Result<bool, Error> {
        if self.uses_local_agent() {
            self.health_check_local(service).await
        } else {
            self.health_check_remote(service).await
        }
    }

    // Ask the node-local agent for its check states
    async fn health_check_local(&self, service: &str) -> Result<bool, Error> {
        let filter = format!("{} in ServiceTags", MATCH_TAG);
        let checks: HashMap<String, AgentCheck> = self
            .request(Method::GET, "/agent/checks")
            .query(&[("filter", filter.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        for check in checks.values() {
            if check.service_name == service {
                if check.status == "passing" {
                    return Ok(true);
                }
                debug!("Local healthcheck for {} returned {}", service, check.status);
                return Ok(false);
            }
        }
        Err(Error::Catalogue(format!(
            "no local healthcheck found for service {} on node {}",
            service, self.node
        )))
    }

    // Ask the catalogue's health endpoint and pick out this node
    async fn health_check_remote(&self, service: &str) -> Result<bool, Error> {
        let checks: Vec<HealthCheck> = self
            .request(Method::GET, &format!("/health/checks/{}", service))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        for check in &checks {
            if check.node == self.node {
                if check.status == "passing" {
                    return Ok(true);
                }
                debug!("Healthcheck for {} returned {}", service, check.status);
                return Ok(false);
            }
        }
        Err(Error::Catalogue(format!(
            "no healthcheck found for node {} in catalogue",
            self.node
        )))
    }

    /// Register the VIP service with a TCP check against this host.
    /// Called when the VIP is announced.
    pub async fn register_vip_service(&self, vip_service: &VipService) -> Result<(), Error> {
        let body = json!({
            "ID": vip_service.name,
            "Name": vip_service.name,
            "Port": vip_service.check_port,
            "Check": {
                "CheckID": vip_service.name,
                "TCP": format!("localhost:{}", vip_service.check_port),
                "Interval": CHECK_INTERVAL,
                "Timeout": CHECK_TIMEOUT,
                "DeregisterCriticalServiceAfter": DEREGISTER_AFTER,
            },
        });
        self.request(Method::PUT, "/agent/service/register")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        info!("Registered vip service {}", vip_service.name);
        Ok(())
    }

    /// Remove the VIP service on withdraw; the catalogue entry removal
    /// is best-effort.
    pub async fn deregister_vip_service(&self, vip_service: &VipService) -> Result<(), Error> {
        self.request(
            Method::PUT,
            &format!("/agent/service/deregister/{}", vip_service.name),
        )
        .send()
        .await?
        .error_for_status()?;
        let body = json!({ "Node": self.node, "ServiceID": vip_service.name });
        if let Err(err) = self
            .request(Method::PUT, "/catalog/deregister")
            .json(&body)
            .send()
            .await
        {
            debug!(
                "Catalogue deregister of {} failed: {}",
                vip_service.name, err
            );
        }
        info!("Deregistered vip service {}", vip_service.name);
        Ok(())
    }
}

/// Translate tagged services into app definitions. Services without the
/// marker tag are ignored; malformed ones are skipped with a log.
pub(crate) fn apps_from_services<I>(services: I) -> Vec<App>
where
    I: IntoIterator<Item = ServiceEntry>,
{
    let mut apps = Vec::new();
    for service in services {
        if !service.tags.iter().any(|t| t == MATCH_TAG) {
            continue;
        }
        let mut vip = None;
        let mut communities: Vec<String> = Vec::new();
        let mut monitors: Vec<String> = Vec::new();
        let mut nats: Vec<String> = Vec::new();
        let mut vip_service_name = None;
        let mut vip_check = None;
        for tag in &service.tags {
            let (key, value) = match tag.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                VIP_TAG => vip = Some(value.to_string()),
                COMMUNITIES_TAG => {
                    communities = value.split(',').map(str::to_string).collect();
                }
                MONITOR_TAG => monitors.push(value.to_string()),
                NAT_TAG => nats.push(value.to_string()),
                VIP_SERVICE_TAG => vip_service_name = Some(value.to_string()),
                VIP_CHECK_TAG => vip_check = Some(value.to_string()),
                _ => (),
            }
        }
        let vip = match vip {
            Some(vip) => vip,
            None => {
                error!("No vip tag found in matched service {}", service.service);
                continue;
            }
        };
        let vip_service = match vip_check {
            Some(check) => {
                let name = vip_service_name
                    .unwrap_or_else(|| format!("{}-vip", service.service));
                match VipService::from_check_spec(name, &check) {
                    Ok(vs) => Some(vs),
                    Err(err) => {
                        error!(
                            "Unable to add discovered app {}: {}",
                            service.service, err
                        );
                        continue;
                    }
                }
            }
            None => None,
        };
        match App::new(
            &service.service,
            &vip,
            &communities,
            &monitors,
            &nats,
            vip_service,
            Source::Discovery,
        ) {
            Ok(app) => apps.push(app),
            Err(err) => error!("Unable to add discovered app {}: {}", service.service, err),
        }
    }
    apps
}
