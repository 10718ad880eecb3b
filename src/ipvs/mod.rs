//! Self-hosted load balancer glue.
//!
//! Every worker node runs a static pod that load-balances the local
//! virtual server `VIP:6443` across the current master set, standing in
//! for a cloud load balancer. The rule engine lives in the lvscare image;
//! this module renders the static pod manifest from the current state,
//! pushes it on membership changes and keeps the VIP host route sane.

use crate::config::ClusterState;
use crate::ssh::Fabric;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;

pub const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
pub const LVSCARE_MANIFEST: &str = "/etc/kubernetes/manifests/kube-sealyun-lvscare.yaml";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StaticPod {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: PodSpec,
}

#[derive(Serialize)]
struct Metadata {
    name: &'static str,
    namespace: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    host_network: bool,
    containers: Vec<Container>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    name: &'static str,
    image: String,
    command: Vec<String>,
    image_pull_policy: &'static str,
    security_context: SecurityContext,
}

#[derive(Serialize)]
struct SecurityContext {
    privileged: bool,
}

/// Typed renderer for the lvscare static pod: virtual server `vip:6443`,
/// one real server per master.
pub struct LvscarePod {
    pub vip: String,
    pub image: String,
    pub masters: Vec<String>,
}

impl LvscarePod {
    pub fn from_state(state: &ClusterState) -> Self {
        LvscarePod {
            vip: state.vip.clone(),
            image: state.lvscarename.clone(),
            masters: state.master_ips(),
        }
    }

    pub fn care_args(&self) -> Vec<String> {
        let mut args = vec![
            "care".to_string(),
            "--vip".to_string(),
            format!("{}:6443", self.vip),
            "--health-path".to_string(),
            "/healthz".to_string(),
            "--health-schem".to_string(),
            "https".to_string(),
        ];
        for master in &self.masters {
            args.push("--rs".to_string());
            args.push(format!("{}:6443", master));
        }
        args
    }

    pub fn render(&self) -> Result<String> {
        let mut command = vec!["/usr/bin/lvscare".to_string()];
        command.extend(self.care_args());
        let pod = StaticPod {
            api_version: "v1",
            kind: "Pod",
            metadata: Metadata {
                name: "kube-sealyun-lvscare",
                namespace: "kube-system",
            },
            spec: PodSpec {
                host_network: true,
                containers: vec![Container {
                    name: "kube-sealyun-lvscare",
                    image: self.image.clone(),
                    command,
                    image_pull_policy: "IfNotPresent",
                    security_context: SecurityContext { privileged: true },
                }],
            },
        };
        Ok(serde_yaml::to_string(&pod)?)
    }
}

/// Write the manifest onto one node.
pub fn push_manifest(fabric: &dyn Fabric, state: &ClusterState, node: &str) -> Result<()> {
    let pod = LvscarePod::from_state(state);
    let yaml = pod.render()?;
    let tmp = std::env::temp_dir().join(format!("lvscare-{}.yaml", iputils::ip_format(node)));
    std::fs::write(&tmp, yaml)?;
    fabric.cmd(node, &format!("mkdir -p {}", MANIFESTS_DIR))?;
    fabric.copy(node, Path::new(&tmp), LVSCARE_MANIFEST)?;
    let _ = std::fs::remove_file(&tmp);
    Ok(())
}

/// Regenerate the manifest on every node after the master set changed.
pub fn refresh_all_nodes(fabric: &dyn Fabric, state: &ClusterState) -> Result<()> {
    if state.nodes.is_empty() {
        return Ok(());
    }
    println!("refreshing lvscare manifest on {} node(s)", state.nodes.len());
    phase::run_phase("refresh lvscare", &state.nodes, |node| {
        push_manifest(fabric, state, node)?;
        check_route(fabric, state, node)
    })
}

/// Seed the IPVS rules once before the kubelet join, so the node can reach
/// the API server through the VIP the instant it joins.
pub fn prewarm_rules(fabric: &dyn Fabric, state: &ClusterState, node: &str) -> Result<()> {
    let pod = LvscarePod::from_state(state);
    let mut cmd = "lvscare".to_string();
    for arg in pod.care_args() {
        cmd.push(' ');
        cmd.push_str(&arg);
    }
    cmd.push_str(" --run-once");
    fabric.cmd(node, &cmd)?;
    Ok(())
}

/// Drop the virtual server rules during clean.
pub fn clear_rules(fabric: &dyn Fabric, state: &ClusterState, node: &str) {
    let cmd = format!("lvscare care --vip {}:6443 --clear", state.vip);
    let _ = fabric.cmd_async(node, &cmd);
}

/// Ensure the node has an explicit host route to the VIP through its own
/// address when the default route does not already cover it.
pub fn check_route(fabric: &dyn Fabric, state: &ClusterState, node: &str) -> Result<()> {
    let ip = iputils::ip_format(node);
    let probe = format!("ip route get {} 2>/dev/null | head -1", state.vip);
    let output = fabric.cmd(node, &probe).unwrap_or_default();
    if output.contains(&format!("src {}", ip)) {
        return Ok(());
    }
    add_route(fabric, &state.vip, ip, node)
}

pub fn add_route(fabric: &dyn Fabric, vip: &str, gateway: &str, host: &str) -> Result<()> {
    fabric.cmd(
        host,
        &format!("ip route add {}/32 via {} 2>/dev/null || true", vip, gateway),
    )?;
    Ok(())
}

pub fn del_route(fabric: &dyn Fabric, vip: &str, host: &str) -> Result<()> {
    fabric.cmd(host, &format!("ip route del {}/32 2>/dev/null || true", vip))?;
    Ok(())
}

/// The `route` subcommand runs on the member itself, so these operate on
/// the local routing table directly.
pub fn local_route_add(vip: &str, gateway: &str) -> Result<()> {
    local_ip_cmd(&format!("ip route add {}/32 via {}", vip, gateway))
}

pub fn local_route_del(vip: &str) -> Result<()> {
    local_ip_cmd(&format!("ip route del {}/32", vip))
}

fn local_ip_cmd(cmd: &str) -> Result<()> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()?;
    if !output.status.success() {
        anyhow::bail!(
            "{} failed: {}",
            cmd,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lists_all_masters() {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into(), "10.0.0.2:22".into()];
        state.nodes = vec!["10.0.0.3".into()];
        let yaml = LvscarePod::from_state(&state).render().unwrap();
        assert!(yaml.contains("--rs"));
        assert!(yaml.contains("10.0.0.1:6443"));
        assert!(yaml.contains("10.0.0.2:6443"));
        assert!(yaml.contains("10.103.97.2:6443"));
        assert!(yaml.contains("hostNetwork: true"));
        assert!(yaml.contains("image: fanux/lvscare:latest"));
    }

    #[test]
    fn test_care_args_order() {
        let pod = LvscarePod {
            vip: "10.103.97.2".into(),
            image: "fanux/lvscare:latest".into(),
            masters: vec!["10.0.0.1".into()],
        };
        let args = pod.care_args().join(" ");
        assert_eq!(
            args,
            "care --vip 10.103.97.2:6443 --health-path /healthz --health-schem https --rs 10.0.0.1:6443"
        );
    }
}
