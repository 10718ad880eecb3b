//! Cluster state store.
//!
//! One YAML document is the canonical desired state of the cluster. It is
//! loaded at the start of every command, mutated in memory by the
//! workflows and dumped back at the end. The file is the only durable
//! record of join/clean changes. There is no cross-invocation locking;
//! two orchestrators racing on the same file is a documented limitation.

use crate::error::PreflightError;
use crate::utils::iputils;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_DOMAIN: &str = "apiserver.cluster.local";
pub const DEFAULT_VIP: &str = "10.103.97.2";
pub const DEFAULT_POD_CIDR: &str = "100.64.0.0/10";
pub const DEFAULT_SVC_CIDR: &str = "10.96.0.0/12";
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";
pub const DEFAULT_REPO: &str = "k8s.gcr.io";
pub const DEFAULT_LVSCARE: &str = "fanux/lvscare:latest";

/// Desired state of the whole cluster. Field names match the YAML keys of
/// the persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct ClusterState {
    /// Ordered master addresses. `masters[0]` is the bootstrap master and
    /// the reference point for tokens, certs and kubectl calls.
    pub masters: Vec<String>,
    /// Ordered worker node addresses.
    pub nodes: Vec<String>,

    pub user: String,
    pub passwd: String,
    pub pkfile: String,
    pub pkpasswd: String,

    pub apiserverdomain: String,
    pub vip: String,
    pub pkgurl: String,
    pub version: String,
    pub repo: String,
    pub podcidr: String,
    pub svccidr: String,
    pub dnsdomain: String,
    pub apiservercertsans: Vec<String>,
    pub certpath: String,
    pub certetcdpath: String,
    pub lvscarename: String,

    /// Last etcd snapshot taken, kept for traceability.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub snapshotname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etcdbackupdir: String,
}

impl Default for ClusterState {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        ClusterState {
            masters: Vec::new(),
            nodes: Vec::new(),
            user: "root".to_string(),
            passwd: String::new(),
            pkfile: format!("{}/.ssh/id_rsa", home.display()),
            pkpasswd: String::new(),
            apiserverdomain: DEFAULT_API_DOMAIN.to_string(),
            vip: DEFAULT_VIP.to_string(),
            pkgurl: String::new(),
            version: String::new(),
            repo: DEFAULT_REPO.to_string(),
            podcidr: DEFAULT_POD_CIDR.to_string(),
            svccidr: DEFAULT_SVC_CIDR.to_string(),
            dnsdomain: DEFAULT_DNS_DOMAIN.to_string(),
            apiservercertsans: Vec::new(),
            certpath: format!("{}/.sealos/pki", home.display()),
            certetcdpath: format!("{}/.sealos/pki/etcd", home.display()),
            lvscarename: DEFAULT_LVSCARE.to_string(),
            snapshotname: String::new(),
            etcdbackupdir: String::new(),
        }
    }
}

/// Default location of the persisted state file.
pub fn default_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".sealos").join("config.yaml")
}

impl ClusterState {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|_| PreflightError::Config(path.display().to_string()))?;
        let state: ClusterState = serde_yaml::from_str(&data)
            .map_err(|_| PreflightError::Config(path.display().to_string()))?;
        Ok(state)
    }

    /// Write the state back. Address range expressions are re-normalized
    /// into a flat deduplicated list so the file on disk is always the
    /// expanded form.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let mut out = self.clone();
        out.masters = iputils::normalize_ips(&self.masters)?;
        out.nodes = iputils::normalize_ips(&self.nodes)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(&out)?;
        fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// A fully populated example document for users starting from nothing.
    pub fn default_config() -> String {
        let example = ClusterState {
            masters: vec!["192.168.0.2".to_string(), "192.168.0.3".to_string()],
            nodes: vec!["192.168.0.4".to_string()],
            passwd: "your-server-password".to_string(),
            pkgurl: "https://sealyun.oss-cn-beijing.aliyuncs.com/kube1.21.0.tar.gz".to_string(),
            version: "v1.21.0".to_string(),
            apiservercertsans: vec!["apiserver.cluster.local".to_string()],
            ..ClusterState::default()
        };
        serde_yaml::to_string(&example).unwrap_or_default()
    }

    /// The bootstrap master address, with error context for commands that
    /// cannot run without one.
    pub fn master0(&self) -> Result<&str, PreflightError> {
        self.masters
            .first()
            .map(|s| s.as_str())
            .ok_or(PreflightError::MasterEmpty)
    }

    pub fn master_ips(&self) -> Vec<String> {
        self.masters
            .iter()
            .map(|m| iputils::ip_format(m).to_string())
            .collect()
    }

    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts = self.masters.clone();
        hosts.extend(self.nodes.iter().cloned());
        hosts
    }
}
