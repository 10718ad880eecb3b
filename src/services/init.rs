//! Cluster bootstrap.
//!
//! Ordered pipeline from an empty host list to a running HA cluster:
//! validate, distribute the package everywhere, bring up the bootstrap
//! master, apply CNI, then reuse the join pipeline for the remaining
//! masters and the nodes. A failure on the bootstrap master aborts the
//! whole command, a half-initialized first master cannot be joined to.

use crate::cert::{self, CertGenerator, KUBECONFIGS};
use crate::config::ClusterState;
use crate::error::PreflightError;
use crate::kubeadm::{self, InitVars};
use crate::net::{CniMeta, CniRenderer, PackagedCni};
use crate::services::{self, join};
use crate::ssh::Fabric;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const PKG_CNI_TEMPLATE: &str = "/root/kube/conf/net/calico.yaml";

#[derive(Debug, Default)]
pub struct InitOptions {
    /// User-supplied kubeadm template, substituted instead of the
    /// built-in documents.
    pub kubeadm_template: Option<PathBuf>,
    /// Interface hint handed to the CNI renderer. An IP means
    /// "can-reach", anything else is an interface name.
    pub interface: String,
    pub without_cni: bool,
}

pub fn build_init(
    state: &mut ClusterState,
    fabric: &dyn Fabric,
    generator: &dyn CertGenerator,
    opts: &InitOptions,
) -> Result<()> {
    // Pre-flight, before any remote action.
    state.masters = iputils::parse_ips(&state.masters)?;
    state.nodes = iputils::parse_ips(&state.nodes)?;
    if state.masters.is_empty() {
        return Err(PreflightError::MasterEmpty.into());
    }
    if state.version.is_empty() {
        return Err(PreflightError::VersionEmpty.into());
    }
    for node in &state.nodes {
        if state.masters.contains(node) {
            return Err(PreflightError::JoinRoleConflict {
                addr: node.clone(),
                actual: "master",
                requested: "node",
            }
            .into());
        }
    }
    services::pkg_url_check(&state.pkgurl)?;

    let master0 = state.master0()?.to_string();
    let all_hosts = state.all_hosts();

    println!("init: {} master(s), {} node(s), version {}",
        state.masters.len(), state.nodes.len(), state.version);

    phase::run_phase("ping", &all_hosts, |host| fabric.ping(host))?;
    phase::run_phase("copy package", &all_hosts, |host| {
        services::send_package(fabric, state, host)
    })?;

    // Render the init config against the bootstrap master's runtime.
    let (api_version, cri_socket) = kubeadm::select_dialect(&state.version);
    let cgroup_driver = kubeadm::probe_cgroup_driver(fabric, &master0, cri_socket)?;
    let sans = cert::default_sans(state);
    let vars = InitVars {
        master0_ip: iputils::ip_format(&master0).to_string(),
        apiserver_domain: state.apiserverdomain.clone(),
        vip: state.vip.clone(),
        version: state.version.clone(),
        repo: state.repo.clone(),
        pod_cidr: state.podcidr.clone(),
        svc_cidr: state.svccidr.clone(),
        dns_domain: state.dnsdomain.clone(),
        cert_sans: sans.clone(),
        api_version,
        cri_socket,
        cgroup_driver,
    };
    let config_yaml = match &opts.kubeadm_template {
        Some(path) => {
            let template = fs::read_to_string(path)
                .with_context(|| format!("failed to read kubeadm template {}", path.display()))?;
            vars.render_custom(&template)?
        }
        None => vars.render()?,
    };

    // Recover what the rendered document actually chose; a user template
    // may override the DNS domain and the SAN list.
    match kubeadm::parse_cluster_config(&config_yaml) {
        Some(parsed) => {
            if !parsed.dns_domain.is_empty() {
                state.dnsdomain = parsed.dns_domain;
            }
            state.apiservercertsans = if parsed.cert_sans.is_empty() {
                sans
            } else {
                parsed.cert_sans
            };
        }
        None => {
            println!("⚠ could not decode cert SANs from the rendered config, using defaults");
            state.apiservercertsans = sans;
        }
    }

    let work_dir = services::work_dir();
    fs::create_dir_all(&work_dir)?;
    let local_config = work_dir.join("kubeadm-config.yaml");
    fs::write(&local_config, &config_yaml)?;
    fabric.copy(&master0, &local_config, services::KUBEADM_CONFIG)?;

    // PKI and kubeconfigs are generated locally and pushed to the
    // bootstrap master; kubeadm skips phases whose artifacts exist.
    let hostname = services::remote_hostname(fabric, &master0)?;
    let req = cert::cert_request(
        state,
        state.apiservercertsans.clone(),
        &hostname,
        work_dir.clone(),
    )?;
    generator.generate_cert(&req)?;
    generator.create_kubeconfigs(&req)?;
    let bootstrap = vec![master0.clone()];
    cert::send_certs(fabric, state, &bootstrap)?;
    cert::send_kubeconfigs(fabric, state, &work_dir, &bootstrap, &KUBECONFIGS)?;

    services::append_etc_hosts(
        fabric,
        &master0,
        iputils::ip_format(&master0),
        &state.apiserverdomain,
    )?;

    // Fatal on failure: nothing after this point can run without a
    // healthy bootstrap master.
    let output = fabric
        .cmd(
            &master0,
            &format!(
                "kubeadm init --config={} --upload-certs",
                services::KUBEADM_CONFIG
            ),
        )
        .with_context(|| {
            format!(
                "[{}] kubeadm init failed, please clean this host before retrying",
                master0
            )
        })?;
    let creds = join::decode_join_credentials(&output)
        .context("kubeadm init succeeded but its join credentials could not be decoded")?;

    fabric.cmd(
        &master0,
        "mkdir -p /root/.kube && cp /etc/kubernetes/admin.conf /root/.kube/config && chmod 600 /root/.kube/config",
    )?;

    if opts.without_cni {
        println!("--without-cni is set, skipping network plugin installation");
    } else {
        apply_cni(state, fabric, &master0, &opts.interface)?;
    }

    if state.masters.len() > 1 {
        let rest: Vec<String> = state.masters[1..].to_vec();
        join::join_master_members(state, fabric, &rest, &creds)?;
    }
    if !state.nodes.is_empty() {
        let nodes = state.nodes.clone();
        join::join_node_members(state, fabric, &nodes, &creds)?;
    }

    println!("✓ cluster is up, kubeconfig is at /root/.kube/config on {}", master0);
    Ok(())
}

/// Apply the CNI manifest shipped with the offline package. The renderer
/// is a collaborator; we hand it the template and apply what comes back.
fn apply_cni(
    state: &ClusterState,
    fabric: &dyn Fabric,
    master0: &str,
    interface: &str,
) -> Result<()> {
    if !fabric.is_file_exist(master0, PKG_CNI_TEMPLATE)? {
        println!(
            "⚠ no CNI template at {} in the package, install a network plugin yourself",
            PKG_CNI_TEMPLATE
        );
        return Ok(());
    }
    let work_dir = services::work_dir();
    let template_path = work_dir.join("cni-template.yaml");
    fabric.fetch(master0, PKG_CNI_TEMPLATE, &template_path)?;
    let template = fs::read_to_string(&template_path)?;

    let iface = if interface.is_empty() {
        "first-found".to_string()
    } else if iputils::is_ipv4(interface) {
        format!("can-reach={}", interface)
    } else {
        format!("interface={}", interface)
    };
    let renderer = PackagedCni {
        meta: CniMeta {
            cidr: state.podcidr.clone(),
            interface: iface,
            mtu: "1440".to_string(),
            repo: state.repo.clone(),
        },
    };
    let manifest = renderer.manifests(&template)?;
    let local = work_dir.join("cni.yaml");
    fs::write(&local, manifest)?;
    fabric.copy(master0, Path::new(&local), "/tmp/cni.yaml")?;
    fabric.cmd(master0, "kubectl apply -f /tmp/cni.yaml")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testutil::FakeFabric;

    struct NoopGenerator;
    impl CertGenerator for NoopGenerator {
        fn generate_cert(&self, _req: &cert::CertRequest) -> Result<()> {
            Ok(())
        }
        fn create_kubeconfigs(&self, _req: &cert::CertRequest) -> Result<()> {
            Ok(())
        }
    }

    fn base_state(pkg: &Path) -> ClusterState {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into(), "10.0.0.2".into()];
        state.nodes = vec!["10.0.0.3".into()];
        state.version = "v1.21.0".into();
        state.pkgurl = pkg.display().to_string();
        state
    }

    #[test]
    fn test_init_rejects_empty_masters() {
        let mut state = ClusterState::default();
        state.version = "v1.21.0".into();
        let fabric = FakeFabric::new();
        let err =
            build_init(&mut state, &fabric, &NoopGenerator, &InitOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<PreflightError>().is_some());
        assert!(fabric.all_commands().is_empty());
    }

    #[test]
    fn test_init_rejects_missing_version() {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into()];
        let fabric = FakeFabric::new();
        let err =
            build_init(&mut state, &fabric, &NoopGenerator, &InitOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PreflightError>(),
            Some(PreflightError::VersionEmpty)
        ));
    }

    #[test]
    fn test_init_rejects_overlapping_roles() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("kube.tar.gz");
        fs::write(&pkg, b"pkg").unwrap();
        let mut state = base_state(&pkg);
        state.nodes = vec!["10.0.0.1".into()];
        let fabric = FakeFabric::new();
        let err =
            build_init(&mut state, &fabric, &NoopGenerator, &InitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("10.0.0.1"));
        assert!(fabric.all_commands().is_empty());
    }

    #[test]
    fn test_init_scenario_two_masters_one_node() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SEALOS_HOME", dir.path());
        let pkg = dir.path().join("kube.tar.gz");
        fs::write(&pkg, b"pkg").unwrap();
        let mut state = base_state(&pkg);

        let fabric = FakeFabric::new()
            .respond("SystemdCgroup", "systemd")
            .respond("hostname", "master-0\n")
            .respond(
                "kubeadm init --config",
                "kubeadm join apiserver.cluster.local:6443 --token abc.def \
                 --discovery-token-ca-cert-hash sha256:beef --certificate-key feed",
            )
            .respond("kubeadm token create", "kubeadm join x:6443 --token abc.def --discovery-token-ca-cert-hash sha256:beef");
        build_init(
            &mut state,
            &fabric,
            &NoopGenerator,
            &InitOptions {
                without_cni: true,
                ..Default::default()
            },
        )
        .unwrap();

        // v1.21.0 renders the v1beta2/containerd dialect.
        let m0 = fabric.commands_for("10.0.0.1").join("\n");
        assert!(m0.contains("SystemdCgroup"));
        assert!(m0.contains("kubeadm init --config"));

        // The second master joins as control plane, never gets lvscare.
        let m1 = fabric.commands_for("10.0.0.2").join("\n");
        assert!(m1.contains("kubeadm join --config"));
        assert!(!m1.contains("lvscare"));

        // The node gets the lvscare manifest listing both masters.
        let node = fabric.commands_for("10.0.0.3").join("\n");
        assert!(node.contains("lvscare"));
        assert!(node.contains("10.0.0.1:6443"));
        assert!(node.contains("10.0.0.2:6443"));

        // SANs were recorded back into the state.
        assert!(state.apiservercertsans.contains(&"127.0.0.1".to_string()));
        assert!(state.apiservercertsans.contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn test_init_bootstrap_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SEALOS_HOME", dir.path());
        let pkg = dir.path().join("kube.tar.gz");
        fs::write(&pkg, b"pkg").unwrap();
        let mut state = base_state(&pkg);

        let fabric = FakeFabric::new()
            .respond("hostname", "master-0\n")
            .fail_on("kubeadm init --config");
        let err = build_init(
            &mut state,
            &fabric,
            &NoopGenerator,
            &InitOptions {
                without_cni: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("kubeadm init failed"));
        // Join never started anywhere.
        for host in ["10.0.0.2", "10.0.0.3"] {
            let cmds = fabric.commands_for(host).join("\n");
            assert!(!cmds.contains("kubeadm join"));
        }
    }
}
