//! Backend configuration.

use rdsys_api::{RdError, RdResult, Registry};
use rdsys_core::{CollectionConfig, TypeConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Our central configuration file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// The backend section. Distributor processes carry their own
    /// sections in the same file; the backend only reads this one.
    pub backend: BackendConfig,
}

/// Configuration for running the backend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendConfig {
    /// The address the web api binds to, e.g. "127.0.0.1:7100".
    pub api_address: String,

    /// A TLS certificate file; plain HTTP when unset.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// The TLS key file belonging to `cert_file`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// The cached-extrainfo file; its `.new` companion is read too.
    pub extrainfo_file: PathBuf,

    /// The bridge network status file.
    pub networkstatus_file: PathBuf,

    /// The bridge descriptors file, carrying the operators' bridge
    /// distribution requests.
    pub descriptors_file: PathBuf,

    /// The per-country bridge block list.
    #[serde(default)]
    pub blocklist_file: Option<PathBuf>,

    /// The per-country bridge allow list.
    #[serde(default)]
    pub allowlist_file: Option<PathBuf>,

    /// Bearer tokens by distributor name.
    pub api_tokens: HashMap<String, String>,

    /// The reachability prober.
    pub bridgestrap_endpoint: String,
    /// The reachability prober's bearer token.
    #[serde(default)]
    pub bridgestrap_token: String,

    /// The bandwidth prober.
    pub onbasca_endpoint: String,
    /// The bandwidth prober's bearer token.
    #[serde(default)]
    pub onbasca_token: String,

    /// Resources whose measured ratio falls below this threshold have
    /// their speed rejected.
    pub bandwidth_ratio_threshold: f64,

    /// Where persisted resource state lives; nothing is persisted when
    /// unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// The proportion of resources that each distributor should get.
    /// E.g. with https set to x and moat set to y, https gets
    /// x/(x+y) of all resources and moat gets y/(x+y).
    pub distribution_proportions: BTreeMap<String, u32>,

    /// Per-resource-type configuration.
    pub resources: HashMap<String, ResourceConfig>,
}

/// The configuration of one resource type.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceConfig {
    /// Whether the type lives in a single hashring instead of a
    /// partitioned one.
    #[serde(default)]
    pub unpartitioned: bool,

    /// Whether resources of this type should be persisted even if
    /// their type does not demand it.
    #[serde(default)]
    pub stored: bool,

    /// Restrict this type to a subset of the configured distributors.
    /// Empty means all of them.
    #[serde(default)]
    pub distributors: Vec<String>,
}

impl Config {
    /// Load the configuration from the given JSON file.
    pub fn load(path: &Path) -> RdResult<Config> {
        let data = std::fs::read(path).map_err(|err| {
            RdError::other(format!(
                "failed to read config {}: {err}",
                path.display(),
            ))
        })?;
        serde_json::from_slice(&data).map_err(|err| {
            RdError::other(format!(
                "failed to parse config {}: {err}",
                path.display(),
            ))
        })
    }
}

impl BackendConfig {
    /// Derive the [CollectionConfig] from this configuration: one type
    /// entry per configured resource type that has a registered
    /// constructor, with the proportions restricted to the type's
    /// distributor subset if one is given.
    pub fn collection_config(&self, registry: &Registry) -> CollectionConfig {
        let mut types = Vec::new();
        for (rtype, conf) in &self.resources {
            let Some(info) = registry.get(rtype) else {
                tracing::warn!(
                    "Skipping {rtype:?} because we have no constructor \
                     for it.",
                );
                continue;
            };
            let proportions = if conf.distributors.is_empty() {
                self.distribution_proportions.clone()
            } else {
                self.distribution_proportions
                    .iter()
                    .filter(|(name, _)| conf.distributors.contains(name))
                    .map(|(name, weight)| (name.clone(), *weight))
                    .collect()
            };
            types.push(TypeConfig {
                rtype: rtype.clone(),
                unpartitioned: conf.unpartitioned,
                proportions,
                stored: conf.stored || info.needs_store,
            });
        }
        CollectionConfig {
            storage_dir: self.storage_dir.clone(),
            types,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_config_file() {
        let raw = serde_json::json!({
            "backend": {
                "api_address": "127.0.0.1:7100",
                "extrainfo_file": "/var/lib/rdsys/cached-extrainfo",
                "networkstatus_file": "/var/lib/rdsys/networkstatus-bridges",
                "descriptors_file": "/var/lib/rdsys/bridge-descriptors",
                "api_tokens": { "https": "secret" },
                "bridgestrap_endpoint": "http://localhost:5000/bridge-state",
                "onbasca_endpoint": "http://localhost:5001/bridge-state",
                "bandwidth_ratio_threshold": 0.75,
                "storage_dir": "/var/lib/rdsys/storage",
                "distribution_proportions": { "https": 1, "moat": 2 },
                "resources": {
                    "obfs4": {},
                    "vanilla": { "distributors": ["https"] },
                    "tblink": { "unpartitioned": true, "stored": true }
                }
            }
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!("127.0.0.1:7100", config.backend.api_address);
        assert_eq!(
            2,
            config.backend.distribution_proportions["moat"],
        );
        assert!(config.backend.resources["tblink"].unpartitioned);

        let registry = rdsys_resources::default_registry();
        let ccfg = config.backend.collection_config(&registry);
        assert_eq!(3, ccfg.types.len());

        let vanilla = ccfg
            .types
            .iter()
            .find(|t| t.rtype == "vanilla")
            .unwrap();
        assert_eq!(1, vanilla.proportions.len());
        assert!(vanilla.proportions.contains_key("https"));

        let tblink =
            ccfg.types.iter().find(|t| t.rtype == "tblink").unwrap();
        assert!(tblink.stored && tblink.unpartitioned);
    }

    #[test]
    fn unknown_types_are_skipped() {
        let config = BackendConfig {
            api_address: "127.0.0.1:0".into(),
            cert_file: None,
            key_file: None,
            extrainfo_file: "/nonexistent".into(),
            networkstatus_file: "/nonexistent".into(),
            descriptors_file: "/nonexistent".into(),
            blocklist_file: None,
            allowlist_file: None,
            api_tokens: HashMap::new(),
            bridgestrap_endpoint: String::new(),
            bridgestrap_token: String::new(),
            onbasca_endpoint: String::new(),
            onbasca_token: String::new(),
            bandwidth_ratio_threshold: 0.75,
            storage_dir: None,
            distribution_proportions: BTreeMap::new(),
            resources: [("obfs9".to_string(), ResourceConfig::default())]
                .into_iter()
                .collect(),
        };
        let registry = rdsys_resources::default_registry();
        assert!(config.collection_config(&registry).types.is_empty());
    }
}
