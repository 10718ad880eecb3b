//! Lifecycle workflows.
//!
//! Each workflow is an ordered pipeline of phases over the relevant
//! hosts. Shared plumbing for package distribution and kubectl calls
//! lives here.

pub mod clean;
pub mod etcd;
pub mod exec;
pub mod init;
pub mod join;
pub mod upgrade;

use crate::config::ClusterState;
use crate::error::PreflightError;
use crate::ssh::Fabric;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SEALOS_BIN: &str = "/usr/bin/sealos";
pub const PKG_ARCHIVE: &str = "/root/kube.tar.gz";
pub const PKG_DIR: &str = "/root/kube";
pub const PKG_BIN_DIR: &str = "/root/kube/bin";
pub const KUBEADM_CONFIG: &str = "/root/kubeadm-config.yaml";

/// Local working directory for rendered configs and generated
/// kubeconfigs, next to the state file. `SEALOS_HOME` overrides it.
pub fn work_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SEALOS_HOME") {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".sealos")
}

/// Pre-flight probe of the offline package location: HTTP URLs must be
/// reachable, anything else must exist on disk.
pub fn pkg_url_check(pkgurl: &str) -> Result<(), PreflightError> {
    if pkgurl.is_empty() {
        return Err(PreflightError::PkgUrl("<empty>".to_string()));
    }
    if pkgurl.starts_with("http") {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|_| PreflightError::PkgUrl(pkgurl.to_string()))?;
        let ok = client
            .get(pkgurl)
            .send()
            .map(|r| r.status().is_success() || r.status().is_redirection())
            .unwrap_or(false);
        if !ok {
            return Err(PreflightError::PkgUrl(pkgurl.to_string()));
        }
        Ok(())
    } else if Path::new(pkgurl).exists() {
        Ok(())
    } else {
        Err(PreflightError::PkgUrl(pkgurl.to_string()))
    }
}

/// Land the orchestrator binary and the offline package on a host and run
/// the package's install script. Copies are checksum-skipped, so re-runs
/// are cheap.
pub fn send_package(fabric: &dyn Fabric, state: &ClusterState, host: &str) -> Result<()> {
    if let Ok(exe) = std::env::current_exe() {
        fabric
            .copy(host, &exe, SEALOS_BIN)
            .with_context(|| format!("failed to send sealos binary to {}", host))?;
        fabric.cmd(host, &format!("chmod +x {}", SEALOS_BIN))?;
    }
    if state.pkgurl.starts_with("http") {
        fabric.cmd(
            host,
            &format!(
                "[ -f {archive} ] || wget -q {url} -O {archive}",
                archive = PKG_ARCHIVE,
                url = state.pkgurl
            ),
        )?;
    } else {
        fabric.copy(host, Path::new(&state.pkgurl), PKG_ARCHIVE)?;
    }
    fabric.cmd(
        host,
        &format!(
            "[ -d {dir} ] || tar zxf {archive} -C /root",
            dir = PKG_DIR,
            archive = PKG_ARCHIVE
        ),
    )?;
    fabric.cmd(host, &format!("cd {}/shell && sh init.sh", PKG_DIR))?;
    Ok(())
}

/// Lowercased hostname of a remote host.
pub fn remote_hostname(fabric: &dyn Fabric, host: &str) -> Result<String> {
    let output = fabric.cmd(host, "hostname")?;
    Ok(output.trim().to_lowercase())
}

/// Node name the API server has registered for a host, matched by
/// InternalIP. Falls back to the host's own hostname when the lookup
/// cannot decide.
pub fn registered_node_name(fabric: &dyn Fabric, master0: &str, host: &str) -> Result<String> {
    let ip = crate::utils::iputils::ip_format(host);
    if let Ok(out) = fabric.cmd(master0, "kubectl get nodes -o json") {
        if let Ok(doc) = serde_json::from_str::<serde_json::Value>(&out) {
            for item in doc
                .get("items")
                .and_then(|i| i.as_array())
                .map(|a| a.as_slice())
                .unwrap_or_default()
            {
                let matched = item
                    .pointer("/status/addresses")
                    .and_then(|a| a.as_array())
                    .map(|addrs| {
                        addrs.iter().any(|a| {
                            a.get("address").and_then(|v| v.as_str()) == Some(ip)
                        })
                    })
                    .unwrap_or(false);
                if matched {
                    if let Some(name) = item.pointer("/metadata/name").and_then(|v| v.as_str()) {
                        return Ok(name.to_string());
                    }
                }
            }
        }
    }
    remote_hostname(fabric, host)
}

/// Run kubectl on the bootstrap master.
pub fn kubectl(fabric: &dyn Fabric, state: &ClusterState, args: &str) -> Result<String> {
    let master0 = state.master0()?;
    fabric.cmd(master0, &format!("kubectl {}", args))
}

/// Idempotently pin a name to an address in a host's /etc/hosts.
pub fn append_etc_hosts(fabric: &dyn Fabric, host: &str, ip: &str, name: &str) -> Result<()> {
    fabric.cmd(
        host,
        &format!(
            "grep -qF '{ip} {name}' /etc/hosts || echo '{ip} {name}' >> /etc/hosts",
            ip = ip,
            name = name
        ),
    )?;
    Ok(())
}

#[cfg(test)]
pub mod testutil {
    //! Recording fake fabric for workflow tests: every call is logged,
    //! command output is matched by substring against canned responses.

    use crate::ssh::Fabric;
    use anyhow::{Result, bail};
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFabric {
        pub calls: Mutex<Vec<(String, String)>>,
        /// (command substring, canned stdout) pairs, first match wins.
        pub responses: Vec<(String, String)>,
        /// Command substrings (or whole host addresses) that fail.
        pub failures: Vec<String>,
    }

    impl FakeFabric {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(mut self, pattern: &str, output: &str) -> Self {
            self.responses.push((pattern.to_string(), output.to_string()));
            self
        }

        pub fn fail_on(mut self, pattern: &str) -> Self {
            self.failures.push(pattern.to_string());
            self
        }

        pub fn commands_for(&self, host: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn all_commands(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, host: &str, what: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), what.to_string()));
        }
    }

    impl Fabric for FakeFabric {
        fn cmd(&self, host: &str, cmd: &str) -> Result<String> {
            self.record(host, cmd);
            if self.failures.iter().any(|p| cmd.contains(p.as_str()) || p == host) {
                bail!("[{}] command failed: {}", host, cmd);
            }
            for (pattern, output) in &self.responses {
                if cmd.contains(pattern.as_str()) {
                    return Ok(output.clone());
                }
            }
            Ok(String::new())
        }

        fn cmd_async(&self, host: &str, cmd: &str) -> Result<()> {
            self.record(host, cmd);
            Ok(())
        }

        fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
            self.record(host, &format!("copy {} -> {}", local.display(), remote));
            Ok(())
        }

        fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
            self.record(host, &format!("fetch {} -> {}", remote, local.display()));
            Ok(())
        }

        fn is_file_exist(&self, host: &str, path: &str) -> Result<bool> {
            self.record(host, &format!("exist? {}", path));
            Ok(false)
        }

        fn ping(&self, host: &str) -> Result<()> {
            self.record(host, "ping");
            if self.failures.iter().any(|p| p == "ping") {
                bail!("[{}] unreachable", host);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::FakeFabric;

    #[test]
    fn test_registered_node_name_matches_internal_ip() {
        let json = r#"{"items":[{"metadata":{"name":"node-5"},"status":{"addresses":[{"type":"InternalIP","address":"10.0.0.5"}]}}]}"#;
        let fabric = FakeFabric::new()
            .respond("kubectl get nodes -o json", json)
            .respond("hostname", "fallback\n");
        let name = registered_node_name(&fabric, "10.0.0.1", "10.0.0.5:22").unwrap();
        assert_eq!(name, "node-5");

        // Unknown IP falls back to the host's own hostname.
        let name = registered_node_name(&fabric, "10.0.0.1", "10.0.0.9").unwrap();
        assert_eq!(name, "fallback");
    }

    #[test]
    fn test_pkg_url_check_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("kube.tar.gz");
        std::fs::write(&pkg, b"pkg").unwrap();
        assert!(pkg_url_check(&pkg.display().to_string()).is_ok());
        assert!(pkg_url_check("/no/such/kube.tar.gz").is_err());
        assert!(pkg_url_check("").is_err());
    }
}
