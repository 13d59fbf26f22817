//! Node Configuration
//!
//! Declarative TOML configuration for one site: who the cluster members are, how partitions
//! map onto replicas, protocol timings and where the coordination store lives.

use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::membership::types::SiteId;
use crate::topology::types::PartitionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("local site {0} is not listed in [[sites]]")]
    UnknownLocalSite(SiteId),
    #[error("site {0} is listed more than once")]
    DuplicateSite(SiteId),
    #[error("partition {0} is listed more than once")]
    DuplicatePartition(PartitionId),
    #[error("partition {partition} names unknown replica {site}")]
    UnknownReplica {
        partition: PartitionId,
        site: SiteId,
    },
    #[error("partition {0} has no replicas")]
    EmptyReplicaOrder(PartitionId),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Top-level configuration of a site process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub local_site: SiteId,
    pub sites: Vec<SiteEntry>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
    #[serde(default)]
    pub agreement: AgreementConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Address of the HTTP status endpoints.
    #[serde(default = "default_status_bind")]
    pub status_bind: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEntry {
    pub id: SiteId,
    pub gossip_addr: SocketAddr,
}

/// Pre-configured promotion order of one partition; the first entry is the initial master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub replicas: Vec<SiteId>,
}

/// Timings of the heartbeat and agreement protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Cadence of the timer driving suspicion and quiescence checks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub suspect_timeout: Duration,
    /// Time for a message to reach every live peer and a reply to come back.
    #[serde(with = "humantime_serde")]
    pub round_timeout: Duration,
    pub max_escalations: u32,
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub cas_timeout: Duration,
    pub cas_attempts: u32,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            tick_interval: Duration::from_millis(50),
            suspect_timeout: Duration::from_secs(2),
            round_timeout: Duration::from_millis(500),
            max_escalations: 4,
            dedup_window: Duration::from_millis(500),
            dedup_capacity: 4096,
            cas_timeout: Duration::from_secs(2),
            cas_attempts: 5,
        }
    }
}

/// Where the topology record lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the coordination store, e.g. `http://10.0.0.1:7100`.
    pub url: Option<String>,
    /// Record key holding the topology epoch.
    pub topology_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            topology_key: "topology".to_string(),
        }
    }
}

fn default_status_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7200))
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut members = BTreeSet::new();
        for site in &self.sites {
            if !members.insert(site.id) {
                return Err(ConfigError::DuplicateSite(site.id));
            }
        }
        if !members.contains(&self.local_site) {
            return Err(ConfigError::UnknownLocalSite(self.local_site));
        }

        let mut partitions = BTreeSet::new();
        for partition in &self.partitions {
            if !partitions.insert(partition.id) {
                return Err(ConfigError::DuplicatePartition(partition.id));
            }
            if partition.replicas.is_empty() {
                return Err(ConfigError::EmptyReplicaOrder(partition.id));
            }
            if let Some(site) = partition.replicas.iter().find(|site| !members.contains(*site)) {
                return Err(ConfigError::UnknownReplica {
                    partition: partition.id,
                    site: *site,
                });
            }
        }

        let timings = [
            ("heartbeat_interval", self.agreement.heartbeat_interval),
            ("tick_interval", self.agreement.tick_interval),
            ("suspect_timeout", self.agreement.suspect_timeout),
            ("round_timeout", self.agreement.round_timeout),
            ("cas_timeout", self.agreement.cas_timeout),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }

        Ok(())
    }

    pub fn members(&self) -> BTreeSet<SiteId> {
        self.sites.iter().map(|site| site.id).collect()
    }

    pub fn gossip_addr(&self, site: SiteId) -> Option<SocketAddr> {
        self.sites
            .iter()
            .find(|entry| entry.id == site)
            .map(|entry| entry.gossip_addr)
    }

    pub fn local_gossip_addr(&self) -> Option<SocketAddr> {
        self.gossip_addr(self.local_site)
    }
}
