//! Cluster growth.
//!
//! Joining splits the incoming addresses into masters and nodes. Masters
//! need a fresh token plus an upload-certs certificate key and a copy of
//! the control-plane kubeconfigs; nodes only need the token, but get the
//! local load balancer seeded before kubelet starts so the API server is
//! reachable through the VIP the instant they join. Credentials are
//! always fetched before any join command that consumes them.

use crate::cert;
use crate::config::ClusterState;
use crate::error::PreflightError;
use crate::ipvs;
use crate::kubeadm::{self, JoinVars};
use crate::services;
use crate::ssh::Fabric;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::fs;

#[derive(Debug, Clone, PartialEq)]
pub struct JoinCredentials {
    pub token: String,
    pub ca_cert_hash: String,
    pub certificate_key: Option<String>,
}

/// Pull token, discovery hash and optional certificate key out of kubeadm
/// output (`kubeadm init`, `kubeadm token create --print-join-command`).
pub fn decode_join_credentials(output: &str) -> Result<JoinCredentials> {
    let token_re = Regex::new(r"--token\s+(\S+)").unwrap();
    let hash_re = Regex::new(r"--discovery-token-ca-cert-hash\s+(\S+)").unwrap();
    let key_re = Regex::new(r"--certificate-key\s+(\S+)").unwrap();

    let token = token_re
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .context("no join token in kubeadm output")?;
    let ca_cert_hash = hash_re
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .context("no discovery hash in kubeadm output")?;
    let certificate_key = key_re
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    Ok(JoinCredentials {
        token,
        ca_cert_hash,
        certificate_key,
    })
}

/// Ask the bootstrap master for fresh join credentials. The certificate
/// key is only minted when a control-plane join needs it.
pub fn fetch_join_credentials(
    fabric: &dyn Fabric,
    state: &ClusterState,
    need_certificate_key: bool,
) -> Result<JoinCredentials> {
    let master0 = state.master0()?;
    let output = fabric
        .cmd(master0, "kubeadm token create --print-join-command")
        .context("failed to create a join token on the bootstrap master")?;
    let mut creds = decode_join_credentials(&output)?;
    if need_certificate_key {
        let output = fabric
            .cmd(master0, "kubeadm init phase upload-certs --upload-certs")
            .context("failed to upload control-plane certs for the certificate key")?;
        let key = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_hexdigit()))
            .context("no certificate key in upload-certs output")?;
        creds.certificate_key = Some(key.to_string());
    }
    Ok(creds)
}

/// Role guard: a target already recorded in the opposite list is rejected
/// before any remote action; one already present in the requested list is
/// skipped.
fn check_targets(
    state: &ClusterState,
    masters: &[String],
    nodes: &[String],
) -> Result<(Vec<String>, Vec<String>), PreflightError> {
    let mut new_masters = Vec::new();
    for addr in masters {
        if state.nodes.contains(addr) {
            return Err(PreflightError::JoinRoleConflict {
                addr: addr.clone(),
                actual: "node",
                requested: "master",
            });
        }
        if state.masters.contains(addr) {
            println!("[{}] already a master, skipping", addr);
        } else {
            new_masters.push(addr.clone());
        }
    }
    let mut new_nodes = Vec::new();
    for addr in nodes {
        if state.masters.contains(addr) {
            return Err(PreflightError::JoinRoleConflict {
                addr: addr.clone(),
                actual: "master",
                requested: "node",
            });
        }
        if state.nodes.contains(addr) {
            println!("[{}] already a node, skipping", addr);
        } else {
            new_nodes.push(addr.clone());
        }
    }
    Ok((new_masters, new_nodes))
}

/// Remote work for a set of new control-plane members. `state` must
/// already know the cluster; membership lists are updated by the caller.
pub fn join_master_members(
    state: &ClusterState,
    fabric: &dyn Fabric,
    new_masters: &[String],
    creds: &JoinCredentials,
) -> Result<()> {
    if creds.certificate_key.is_none() {
        bail!("control-plane join requires a certificate key");
    }
    let master0_ip = iputils::ip_format(state.master0()?).to_string();
    let (api_version, cri_socket) = kubeadm::select_dialect(&state.version);
    let work_dir = services::work_dir();
    fs::create_dir_all(&work_dir)?;

    phase::run_phase("copy package", new_masters, |host| {
        services::send_package(fabric, state, host)
    })?;

    cert::send_certs(fabric, state, new_masters)?;
    cert::send_kubeconfigs(
        fabric,
        state,
        &work_dir,
        new_masters,
        &["admin.conf", "controller-manager.conf", "scheduler.conf"],
    )?;

    phase::run_phase("join masters", new_masters, |host| {
        let ip = iputils::ip_format(host).to_string();
        // The shared domain must resolve before the apiserver is local.
        services::append_etc_hosts(fabric, host, &master0_ip, &state.apiserverdomain)?;

        let cgroup_driver = kubeadm::probe_cgroup_driver(fabric, host, cri_socket)?;
        let vars = JoinVars {
            api_server_endpoint: format!("{}:6443", state.apiserverdomain),
            token: creds.token.clone(),
            ca_cert_hash: creds.ca_cert_hash.clone(),
            certificate_key: creds.certificate_key.clone(),
            advertise_address: Some(ip.clone()),
            api_version,
            cri_socket,
            cgroup_driver,
        };
        let config = vars.render()?;
        let local = work_dir.join(format!("kubeadm-join-{}.yaml", ip));
        fs::write(&local, config)?;
        fabric.copy(host, &local, services::KUBEADM_CONFIG)?;
        let _ = fs::remove_file(&local);

        fabric
            .cmd(
                host,
                &format!("kubeadm join --config {}", services::KUBEADM_CONFIG),
            )
            .with_context(|| format!("[{}] control-plane join failed", host))?;

        // Now that the apiserver runs here, pin the domain to ourselves.
        fabric.cmd(
            host,
            &format!(
                "sed -i 's/{} {domain}/{} {domain}/' /etc/hosts",
                master0_ip,
                ip,
                domain = state.apiserverdomain
            ),
        )?;
        fabric.cmd(
            host,
            "mkdir -p /root/.kube && cp /etc/kubernetes/admin.conf /root/.kube/config && chmod 600 /root/.kube/config",
        )?;
        Ok(())
    })
}

/// Remote work for a set of new worker nodes. The lvscare manifest and an
/// IPVS pre-warm land before the kubelet join so the VIP already answers.
pub fn join_node_members(
    state: &ClusterState,
    fabric: &dyn Fabric,
    new_nodes: &[String],
    creds: &JoinCredentials,
) -> Result<()> {
    let (api_version, cri_socket) = kubeadm::select_dialect(&state.version);
    let work_dir = services::work_dir();
    fs::create_dir_all(&work_dir)?;

    phase::run_phase("copy package", new_nodes, |host| {
        services::send_package(fabric, state, host)
    })?;

    phase::run_phase("join nodes", new_nodes, |host| {
        let ip = iputils::ip_format(host).to_string();
        services::append_etc_hosts(fabric, host, &state.vip, &state.apiserverdomain)?;
        ipvs::push_manifest(fabric, state, host)?;
        ipvs::prewarm_rules(fabric, state, host)?;

        let cgroup_driver = kubeadm::probe_cgroup_driver(fabric, host, cri_socket)?;
        let vars = JoinVars {
            api_server_endpoint: format!("{}:6443", state.vip),
            token: creds.token.clone(),
            ca_cert_hash: creds.ca_cert_hash.clone(),
            certificate_key: None,
            advertise_address: None,
            api_version,
            cri_socket,
            cgroup_driver,
        };
        let config = vars.render()?;
        let local = work_dir.join(format!("kubeadm-join-{}.yaml", ip));
        fs::write(&local, config)?;
        fabric.copy(host, &local, services::KUBEADM_CONFIG)?;
        let _ = fs::remove_file(&local);

        fabric
            .cmd(
                host,
                &format!("kubeadm join --config {}", services::KUBEADM_CONFIG),
            )
            .with_context(|| format!("[{}] node join failed", host))?;

        ipvs::check_route(fabric, state, host)
    })
}

/// The `join` command: guards, credential fetch, masters before nodes,
/// membership updates and the HA refresh that must follow them.
pub fn build_join(
    state: &mut ClusterState,
    fabric: &dyn Fabric,
    masters: &[String],
    nodes: &[String],
) -> Result<()> {
    let masters = iputils::parse_ips(masters)?;
    let nodes = iputils::parse_ips(nodes)?;
    let (new_masters, new_nodes) = check_targets(state, &masters, &nodes)?;
    if new_masters.is_empty() && new_nodes.is_empty() {
        println!("nothing to join");
        return Ok(());
    }

    let mut new_hosts = new_masters.clone();
    new_hosts.extend(new_nodes.iter().cloned());
    phase::run_phase("ping", &new_hosts, |host| fabric.ping(host))?;

    let creds = fetch_join_credentials(fabric, state, !new_masters.is_empty())?;

    if !new_masters.is_empty() {
        join_master_members(state, fabric, &new_masters, &creds)?;
        state.masters.extend(new_masters.iter().cloned());
        // Membership changed, every node's local balancer must learn the
        // new real servers.
        ipvs::refresh_all_nodes(fabric, state)?;
    }
    if !new_nodes.is_empty() {
        join_node_members(state, fabric, &new_nodes, &creds)?;
        state.nodes.extend(new_nodes.iter().cloned());
    }
    Ok(())
}
