//! Certificate and kubeconfig provisioning.
//!
//! The PKI is generated once, locally, and fanned out identically to the
//! masters so every control plane node trusts the same CA. The crypto
//! primitives themselves live in kubeadm; this module computes the SAN
//! set, drives the generator and distributes the results.

use crate::config::ClusterState;
use crate::ssh::Fabric;
use crate::utils::{iputils, versionutil};
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

pub const KUBE_CONF_DIR: &str = "/etc/kubernetes";
pub const CONTROLLER_CONF: &str = "/etc/kubernetes/controller-manager.conf";
pub const SCHEDULER_CONF: &str = "/etc/kubernetes/scheduler.conf";

pub const KUBECONFIGS: [&str; 4] = [
    "admin.conf",
    "kubelet.conf",
    "controller-manager.conf",
    "scheduler.conf",
];

/// Everything the generator needs to produce the CA, the leaf certs and
/// the four control-plane kubeconfigs.
#[derive(Debug, Clone)]
pub struct CertRequest {
    pub cert_path: String,
    pub etcd_cert_path: String,
    pub sans: Vec<String>,
    pub bootstrap_ip: String,
    pub bootstrap_hostname: String,
    pub svc_cidr: String,
    pub dns_domain: String,
    pub apiserver_domain: String,
    /// Where the kubeconfigs land locally before distribution.
    pub config_dir: PathBuf,
}

/// Seam to the generation primitives. The shipped implementation drives
/// the local kubeadm binary; tests substitute a fake.
pub trait CertGenerator: Sync {
    fn generate_cert(&self, req: &CertRequest) -> Result<()>;
    fn create_kubeconfigs(&self, req: &CertRequest) -> Result<()>;
}

/// Drives `kubeadm init phase certs` / `kubeadm init phase kubeconfig` on
/// the orchestrator host against a minimal rendered config.
pub struct KubeadmCertGenerator;

impl KubeadmCertGenerator {
    fn phase_config(req: &CertRequest) -> String {
        let sans = req
            .sans
            .iter()
            .map(|s| format!("  - {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            r#"apiVersion: kubeadm.k8s.io/v1beta2
kind: ClusterConfiguration
certificatesDir: {dir}
controlPlaneEndpoint: "{domain}:6443"
networking:
  dnsDomain: {dns}
  serviceSubnet: {svc}
apiServer:
  certSANs:
{sans}
---
apiVersion: kubeadm.k8s.io/v1beta2
kind: InitConfiguration
localAPIEndpoint:
  advertiseAddress: {ip}
nodeRegistration:
  name: {hostname}
"#,
            dir = req.cert_path,
            domain = req.apiserver_domain,
            dns = req.dns_domain,
            svc = req.svc_cidr,
            sans = sans,
            ip = req.bootstrap_ip,
            hostname = req.bootstrap_hostname,
        )
    }

    fn run_phase(config_path: &Path, args: &[&str]) -> Result<()> {
        let output = std::process::Command::new("kubeadm")
            .args(args)
            .arg("--config")
            .arg(config_path)
            .output()
            .context("failed to run local kubeadm, is it installed on this machine?")?;
        if !output.status.success() {
            bail!(
                "kubeadm {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl CertGenerator for KubeadmCertGenerator {
    fn generate_cert(&self, req: &CertRequest) -> Result<()> {
        fs::create_dir_all(&req.cert_path)?;
        fs::create_dir_all(&req.etcd_cert_path)?;
        let config = Self::phase_config(req);
        let path = req.config_dir.join("cert-phase.yaml");
        fs::create_dir_all(&req.config_dir)?;
        fs::write(&path, config)?;
        Self::run_phase(&path, &["init", "phase", "certs", "all"])
    }

    fn create_kubeconfigs(&self, req: &CertRequest) -> Result<()> {
        let path = req.config_dir.join("cert-phase.yaml");
        Self::run_phase(
            &path,
            &[
                "init",
                "phase",
                "kubeconfig",
                "all",
                "--kubeconfig-dir",
                &req.config_dir.display().to_string(),
            ],
        )
    }
}

/// SAN set for the API server: loopback, the shared domain, the VIP,
/// every master IP and whatever the user added.
pub fn default_sans(state: &ClusterState) -> Vec<String> {
    let mut sans = vec![
        "127.0.0.1".to_string(),
        state.apiserverdomain.clone(),
        state.vip.clone(),
    ];
    for san in &state.apiservercertsans {
        if !sans.contains(san) {
            sans.push(san.clone());
        }
    }
    for master in &state.masters {
        let ip = iputils::ip_format(master).to_string();
        if !sans.contains(&ip) {
            sans.push(ip);
        }
    }
    sans
}

pub fn cert_request(
    state: &ClusterState,
    sans: Vec<String>,
    bootstrap_hostname: &str,
    config_dir: PathBuf,
) -> Result<CertRequest> {
    let master0 = state.master0()?;
    Ok(CertRequest {
        cert_path: state.certpath.clone(),
        etcd_cert_path: state.certetcdpath.clone(),
        sans,
        bootstrap_ip: iputils::ip_format(master0).to_string(),
        bootstrap_hostname: bootstrap_hostname.to_string(),
        svc_cidr: state.svccidr.clone(),
        dns_domain: state.dnsdomain.clone(),
        apiserver_domain: state.apiserverdomain.clone(),
        config_dir,
    })
}

/// Push the local PKI directory to `/etc/kubernetes/pki` on each host.
pub fn send_certs(fabric: &dyn Fabric, state: &ClusterState, hosts: &[String]) -> Result<()> {
    let local = Path::new(&state.certpath);
    for host in hosts {
        fabric.cmd(host, "mkdir -p /etc/kubernetes/pki/etcd")?;
        fabric.copy(host, local, "/etc/kubernetes/pki")?;
    }
    Ok(())
}

/// Push a subset of the generated kubeconfigs to each host.
pub fn send_kubeconfigs(
    fabric: &dyn Fabric,
    state: &ClusterState,
    config_dir: &Path,
    hosts: &[String],
    names: &[&str],
) -> Result<()> {
    for host in hosts {
        fabric.cmd(host, &format!("mkdir -p {}", KUBE_CONF_DIR))?;
        for name in names {
            let local = config_dir.join(name);
            fabric.copy(host, &local, &format!("{}/{}", KUBE_CONF_DIR, name))?;
        }
    }
    fix_11911192(fabric, state, hosts)
}

/// The `cert` command: extend the SAN set, regenerate the PKI locally and
/// fan it out to every master. The API server picks the new serving cert
/// up on its next restart.
pub fn update_cluster_certs(
    state: &mut ClusterState,
    fabric: &dyn Fabric,
    generator: &dyn CertGenerator,
    alt_names: &[String],
) -> Result<()> {
    let master0 = state.master0()?.to_string();
    for name in alt_names {
        if !state.apiservercertsans.contains(name) {
            state.apiservercertsans.push(name.clone());
        }
    }
    let sans = default_sans(state);
    state.apiservercertsans = sans.clone();

    let hostname = crate::services::remote_hostname(fabric, &master0)?;
    let work_dir = crate::services::work_dir();
    fs::create_dir_all(&work_dir)?;
    let req = cert_request(state, sans, &hostname, work_dir)?;
    generator.generate_cert(&req)?;

    let masters = state.masters.clone();
    send_certs(fabric, state, &masters)?;
    println!(
        "✓ certificates regenerated and distributed, restart kube-apiserver on each master to pick them up"
    );
    Ok(())
}

/// Kubernetes 1.19.1 and 1.19.2 ship a defect where controller-manager
/// and scheduler must talk to the local API server instead of the shared
/// domain. Rewrite their kubeconfigs in place on each affected master.
pub fn fix_11911192(fabric: &dyn Fabric, state: &ClusterState, masters: &[String]) -> Result<()> {
    let v = versionutil::to_int_all(&state.version);
    if !(1191..=1192).contains(&v) {
        return Ok(());
    }
    println!("applying 1.19.1/1.19.2 local apiserver rewrite");
    for master in masters {
        let ip = iputils::ip_format(master);
        let cmd = format!(
            "grep -qF '{domain}' {sched} && sed -i 's/{domain}/{ip}/' {cm} && sed -i 's/{domain}/{ip}/' {sched}",
            domain = state.apiserverdomain,
            ip = ip,
            cm = CONTROLLER_CONF,
            sched = SCHEDULER_CONF,
        );
        fabric.cmd_async(master, &cmd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ClusterState {
        let mut s = ClusterState::default();
        s.masters = vec!["10.0.0.1".into(), "10.0.0.2:22".into()];
        s.apiservercertsans = vec!["my.example.org".into()];
        s
    }

    #[test]
    fn test_default_sans() {
        let sans = default_sans(&state());
        assert_eq!(
            sans,
            vec![
                "127.0.0.1",
                "apiserver.cluster.local",
                "10.103.97.2",
                "my.example.org",
                "10.0.0.1",
                "10.0.0.2",
            ]
        );
    }

    #[test]
    fn test_phase_config_contains_sans() {
        let s = state();
        let req = cert_request(&s, default_sans(&s), "master-0", PathBuf::from("/tmp/x")).unwrap();
        let config = KubeadmCertGenerator::phase_config(&req);
        assert!(config.contains("  - my.example.org"));
        assert!(config.contains("advertiseAddress: 10.0.0.1"));
        assert!(config.contains("name: master-0"));
    }

    #[test]
    fn test_cert_request_needs_master() {
        let s = ClusterState::default();
        assert!(cert_request(&s, Vec::new(), "h", PathBuf::from("/tmp/x")).is_err());
    }
}
