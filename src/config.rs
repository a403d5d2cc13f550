// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::agent::AgentRunner;
use crate::cloud::client::default_endpoint;
use crate::cloud::Credentials;
use crate::constants::PROVIDER_PREFIX;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};
use url::Url;

const DEFAULT_API_ENVIRONMENT: &str = "api";

/// Cloud configuration file, YAML
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub global: GlobalConfig,
    pub instances: InstancesConfig,
    pub load_balancer: LoadBalancerConfig,
    pub sks_agent: SksAgentConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub zone: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_credentials_file: String,
    pub api_endpoint: String,
    pub api_environment: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstancesConfig {
    pub disabled: bool,
    /// Only use static overrides, never the Exoscale API
    pub external_only: bool,
    pub overrides: Vec<InstanceOverride>,
}

/// Statically configured instance, typically a Node running outside Exoscale
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceOverride {
    /// Node name, or a regular expression when enclosed in slashes
    pub name: String,
    pub external: bool,
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SksAgentConfig {
    pub runners: Vec<String>,
}

impl CloudConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse cloud configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cloud configuration {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Override file values with the environment, as resolved by `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let global = &mut self.global;
        for (key, target) in [
            ("EXOSCALE_ZONE", &mut global.zone),
            ("EXOSCALE_API_KEY", &mut global.api_key),
            ("EXOSCALE_API_SECRET", &mut global.api_secret),
            ("EXOSCALE_API_CREDENTIALS_FILE", &mut global.api_credentials_file),
            ("EXOSCALE_API_ENDPOINT", &mut global.api_endpoint),
            ("EXOSCALE_API_ENVIRONMENT", &mut global.api_environment),
        ] {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        }

        if let Some(runners) = lookup("EXOSCALE_SKS_AGENT_RUNNERS") {
            self.sks_agent.runners = runners
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

impl InstanceOverride {
    /// Instance ID this override answers to: the explicit external ID, or one
    /// derived from the name
    pub fn provider_id(&self) -> String {
        if self.external_id.is_empty() {
            default_external_id(&self.name)
        } else {
            self.external_id.clone()
        }
    }

    /// Region reported for external instances
    pub fn zone_region(&self) -> &str {
        if self.region.is_empty() {
            "external"
        } else {
            &self.region
        }
    }

    fn name_pattern(&self) -> Option<&str> {
        let name = self.name.as_str();
        if name.len() >= 2 && name.starts_with('/') && name.ends_with('/') {
            Some(&name[1..name.len() - 1])
        } else {
            None
        }
    }
}

fn default_external_id(name: &str) -> String {
    format!("external-{:x}", Sha256::digest(name.as_bytes()))
}

impl InstancesConfig {
    /// Override for a Node name: exact name match first, then `/regex/` entries
    pub fn override_for_node(&self, node_name: &str) -> Option<&InstanceOverride> {
        self.overrides
            .iter()
            .find(|o| !o.name.is_empty() && o.name == node_name)
            .or_else(|| {
                self.overrides.iter().find(|o| {
                    o.name_pattern()
                        .and_then(|pattern| Regex::new(pattern).ok())
                        .map(|re| re.is_match(node_name))
                        .unwrap_or(false)
                })
            })
    }

    /// Override for a provider ID: explicit external ID first, then name-derived ones
    pub fn override_for_provider_id(&self, provider_id: &str) -> Option<&InstanceOverride> {
        let id = provider_id.strip_prefix(PROVIDER_PREFIX).unwrap_or(provider_id);

        self.overrides
            .iter()
            .find(|o| !o.external_id.is_empty() && o.external_id == id)
            .or_else(|| {
                self.overrides
                    .iter()
                    .find(|o| o.external_id.is_empty() && default_external_id(&o.name) == id)
            })
    }
}

/// Where API credentials come from
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Static(Credentials),
    /// JSON file, watched for changes
    File(PathBuf),
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub zone: String,
    pub endpoint: Url,
    pub credentials: CredentialSource,
    pub instances: InstancesConfig,
    pub load_balancer_enabled: bool,
    pub sks_agent_runners: Vec<AgentRunner>,
}

impl Config {
    /// Load the cloud configuration named by `EXOSCALE_CCM_CONFIG` (if any) and
    /// apply environment overrides
    pub fn from_env() -> Result<Self> {
        let mut cloud = match env::var("EXOSCALE_CCM_CONFIG") {
            Ok(path) if !path.is_empty() => CloudConfig::from_file(Path::new(&path))?,
            _ => CloudConfig::default(),
        };
        cloud.apply_env(|key| env::var(key).ok());

        Self::from_cloud_config(cloud)
    }

    pub fn from_cloud_config(cloud: CloudConfig) -> Result<Self> {
        let global = cloud.global;

        if global.zone.is_empty() {
            bail!("Exoscale zone not specified (global.zone or EXOSCALE_ZONE)");
        }

        let has_key_pair = !global.api_key.is_empty() || !global.api_secret.is_empty();
        let credentials = match (has_key_pair, global.api_credentials_file.is_empty()) {
            (true, false) => {
                bail!("API key/secret and API credentials file are mutually exclusive")
            }
            (false, false) => CredentialSource::File(PathBuf::from(&global.api_credentials_file)),
            (true, true) => CredentialSource::Static(
                Credentials::new("", global.api_key, global.api_secret)
                    .context("Invalid Exoscale API credentials")?,
            ),
            (false, true) => bail!(
                "Exoscale API credentials not specified (API key/secret or credentials file)"
            ),
        };

        let endpoint = if global.api_endpoint.is_empty() {
            let environment = if global.api_environment.is_empty() {
                DEFAULT_API_ENVIRONMENT
            } else {
                global.api_environment.as_str()
            };
            default_endpoint(environment, &global.zone)
                .context("Failed to build Exoscale API endpoint")?
        } else {
            Url::parse(&global.api_endpoint)
                .with_context(|| format!("Invalid API endpoint {}", global.api_endpoint))?
        };

        let sks_agent_runners = cloud
            .sks_agent
            .runners
            .iter()
            .map(|r| r.parse::<AgentRunner>().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            zone: global.zone,
            endpoint,
            credentials,
            instances: cloud.instances,
            load_balancer_enabled: !cloud.load_balancer.disabled,
            sks_agent_runners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
global:
  zone: ch-gva-2
  apiCredentialsFile: /etc/exoscale/credentials.json
instances:
  externalOnly: false
  overrides:
    - name: edge-1
      external: true
      region: on-prem
    - name: "/^edge-.*$/"
      external: true
    - name: legacy
      external: true
      externalID: custom-id
loadBalancer:
  disabled: true
sksAgent:
  runners: [node-csr-validation]
"#;

    fn make_env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_yaml() {
        let config = Config::from_cloud_config(CloudConfig::from_yaml(CONFIG).unwrap()).unwrap();

        assert_eq!(config.zone, "ch-gva-2");
        assert_eq!(config.endpoint.as_str(), "https://api-ch-gva-2.exoscale.com/v2");
        assert!(matches!(
            config.credentials,
            CredentialSource::File(ref p) if p == Path::new("/etc/exoscale/credentials.json")
        ));
        assert!(!config.load_balancer_enabled);
        assert_eq!(config.sks_agent_runners, vec![AgentRunner::NodeCsrValidation]);
        assert_eq!(config.instances.overrides.len(), 3);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut cloud = CloudConfig::from_yaml(CONFIG).unwrap();
        cloud.apply_env(make_env(&[
            ("EXOSCALE_ZONE", "de-fra-1"),
            ("EXOSCALE_API_CREDENTIALS_FILE", ""),
            ("EXOSCALE_API_KEY", "EXOkey"),
            ("EXOSCALE_API_SECRET", "secret"),
            ("EXOSCALE_API_ENVIRONMENT", "ppapi"),
            ("EXOSCALE_SKS_AGENT_RUNNERS", " "),
        ]));

        let config = Config::from_cloud_config(cloud).unwrap();
        assert_eq!(config.zone, "de-fra-1");
        assert_eq!(config.endpoint.as_str(), "https://ppapi-de-fra-1.exoscale.com/v2");
        assert!(matches!(config.credentials, CredentialSource::Static(ref c) if c.api_key == "EXOkey"));
        assert!(config.sks_agent_runners.is_empty());
    }

    #[test]
    fn test_explicit_endpoint() {
        let mut cloud = CloudConfig::default();
        cloud.apply_env(make_env(&[
            ("EXOSCALE_ZONE", "at-vie-1"),
            ("EXOSCALE_API_KEY", "EXOkey"),
            ("EXOSCALE_API_SECRET", "secret"),
            ("EXOSCALE_API_ENDPOINT", "http://localhost:8080/v2"),
        ]));

        let config = Config::from_cloud_config(cloud).unwrap();
        assert_eq!(config.endpoint.as_str(), "http://localhost:8080/v2");
        assert!(config.load_balancer_enabled);
    }

    #[test]
    fn test_validation_errors() {
        let mut missing_zone = CloudConfig::default();
        missing_zone.apply_env(make_env(&[("EXOSCALE_API_KEY", "k"), ("EXOSCALE_API_SECRET", "s")]));
        assert!(Config::from_cloud_config(missing_zone).is_err());

        let mut missing_credentials = CloudConfig::default();
        missing_credentials.apply_env(make_env(&[("EXOSCALE_ZONE", "ch-gva-2")]));
        assert!(Config::from_cloud_config(missing_credentials).is_err());

        let mut both = CloudConfig::from_yaml(CONFIG).unwrap();
        both.apply_env(make_env(&[("EXOSCALE_API_KEY", "k"), ("EXOSCALE_API_SECRET", "s")]));
        assert!(Config::from_cloud_config(both).is_err());

        let mut unknown_runner = CloudConfig::from_yaml(CONFIG).unwrap();
        unknown_runner.apply_env(make_env(&[("EXOSCALE_SKS_AGENT_RUNNERS", "node-csr-validation,bogus")]));
        let err = Config::from_cloud_config(unknown_runner).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_override_for_node_prefers_exact_match() {
        let cloud = CloudConfig::from_yaml(CONFIG).unwrap();

        let exact = cloud.instances.override_for_node("edge-1").unwrap();
        assert_eq!(exact.zone_region(), "on-prem");

        let pattern = cloud.instances.override_for_node("edge-2").unwrap();
        assert_eq!(pattern.name, "/^edge-.*$/");
        assert_eq!(pattern.zone_region(), "external");

        assert!(cloud.instances.override_for_node("node-1").is_none());
    }

    #[test]
    fn test_override_for_provider_id() {
        let cloud = CloudConfig::from_yaml(CONFIG).unwrap();
        let instances = &cloud.instances;

        let legacy = instances.override_for_provider_id("exoscale://custom-id").unwrap();
        assert_eq!(legacy.name, "legacy");

        let edge_id = instances.overrides[0].provider_id();
        assert!(edge_id.starts_with("external-"));
        assert_eq!(edge_id.len(), "external-".len() + 64);
        let edge = instances
            .override_for_provider_id(&format!("exoscale://{}", edge_id))
            .unwrap();
        assert_eq!(edge.name, "edge-1");

        assert!(instances.override_for_provider_id("exoscale://other").is_none());
    }
}
