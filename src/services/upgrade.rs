//! Rolling version upgrade.
//!
//! A compatibility gate runs before anything else: downgrades, no-ops and
//! jumps of more than one minor version are rejected outright. The
//! 1.19 -> 1.20 boundary passes the gate but carries the docker to
//! containerd runtime switch, surfaced as a hard requirement on every
//! host. After the gate, each member is cordoned, drained, given the new
//! kubeadm/kubelet artifacts, upgraded and uncordoned, masters first.

use crate::config::ClusterState;
use crate::services::{self, PKG_BIN_DIR};
use crate::ssh::Fabric;
use crate::utils::confirm::Confirmer;
use crate::utils::phase;
use crate::utils::versionutil;
use anyhow::{Context, Result};

pub fn build_upgrade(
    state: &mut ClusterState,
    fabric: &dyn Fabric,
    new_version: &str,
    new_pkg_url: Option<&str>,
    confirmer: &dyn Confirmer,
) -> Result<()> {
    let verdict = versionutil::can_upgrade(new_version, &state.version)?;
    if verdict.cri_switch {
        println!(
            "⚠ {} -> {} crosses the 1.19/1.20 boundary: the container runtime switches \
             from docker to containerd. The offline package for {} must ship containerd.",
            state.version, new_version, new_version
        );
    }
    if let Some(url) = new_pkg_url {
        services::pkg_url_check(url)?;
        state.pkgurl = url.to_string();
    }
    if !confirmer.confirm(&format!(
        "upgrade cluster from {} to {}, continue?",
        state.version, new_version
    ))? {
        println!("upgrade aborted");
        return Ok(());
    }

    let all_hosts = state.all_hosts();
    phase::run_phase("copy package", &all_hosts, |host| {
        services::send_package(fabric, state, host)
    })?;

    // Bootstrap master first and alone, it runs the plan apply.
    let master0 = state.master0()?.to_string();
    upgrade_host(fabric, state, &master0, new_version, true)
        .with_context(|| format!("[{}] upgrade of the bootstrap master failed", master0))?;

    if state.masters.len() > 1 {
        let rest: Vec<String> = state.masters[1..].to_vec();
        phase::run_phase("upgrade masters", &rest, |host| {
            upgrade_host(fabric, state, host, new_version, false)
        })?;
    }
    if !state.nodes.is_empty() {
        let nodes = state.nodes.clone();
        phase::run_phase("upgrade nodes", &nodes, |host| {
            upgrade_host(fabric, state, host, new_version, false)
        })?;
    }

    state.version = new_version.to_string();
    println!("✓ cluster upgraded to {}", new_version);
    Ok(())
}

fn upgrade_host(
    fabric: &dyn Fabric,
    state: &ClusterState,
    host: &str,
    new_version: &str,
    apply: bool,
) -> Result<()> {
    let name = services::remote_hostname(fabric, host)?;
    services::kubectl(fabric, state, &format!("cordon {}", name))?;
    if let Err(e) = services::kubectl(
        fabric,
        state,
        &format!(
            "drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=90s",
            name
        ),
    ) {
        // Pods stuck on a draining member should not wedge the upgrade.
        eprintln!("[{}] drain incomplete: {:#}", host, e);
    }

    fabric.cmd(
        host,
        &format!(
            "cp -f {bin}/kubeadm /usr/bin/kubeadm && cp -f {bin}/kubelet /usr/bin/kubelet",
            bin = PKG_BIN_DIR
        ),
    )?;
    if apply {
        fabric.cmd(
            host,
            &format!("kubeadm upgrade apply {} -y", new_version),
        )?;
    } else {
        fabric.cmd(host, "kubeadm upgrade node")?;
    }
    fabric.cmd(host, "systemctl daemon-reload && systemctl restart kubelet")?;

    services::kubectl(fabric, state, &format!("uncordon {}", name))?;
    println!("[{}] upgraded", host);
    Ok(())
}
