//! Cluster shrink and teardown.
//!
//! Three mutually exclusive modes: an explicit node list, an explicit
//! master list, or everything. Nodes are cleaned before masters so they
//! can still be deregistered while the API server is reachable. Per-host
//! failures are logged and do not stop the remaining hosts; a teardown
//! that got halfway must still take down as much as it can.

use crate::config::ClusterState;
use crate::error::PreflightError;
use crate::ipvs;
use crate::services::{self, SEALOS_BIN};
use crate::ssh::{self, Fabric};
use crate::utils::confirm::Confirmer;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::Result;

#[derive(Debug, PartialEq, Eq)]
pub enum CleanOutcome {
    /// Some members were removed, state must be dumped.
    Partial,
    /// The whole cluster is gone, the config file must be deleted.
    WipedAll,
    Aborted,
}

pub fn build_clean(
    state: &mut ClusterState,
    fabric: &dyn Fabric,
    masters: &[String],
    nodes: &[String],
    all: bool,
    confirmer: &dyn Confirmer,
) -> Result<CleanOutcome> {
    let masters = iputils::parse_ips(masters)?;
    let nodes = iputils::parse_ips(nodes)?;

    // Role guards before anything touches a host.
    for addr in &nodes {
        if state.masters.contains(addr) {
            return Err(PreflightError::CleanRoleConflict {
                addr: addr.clone(),
                actual: "master",
            }
            .into());
        }
    }
    for addr in &masters {
        if state.nodes.contains(addr) {
            return Err(PreflightError::CleanRoleConflict {
                addr: addr.clone(),
                actual: "node",
            }
            .into());
        }
    }

    let (target_nodes, target_masters) = if all {
        (state.nodes.clone(), state.masters.clone())
    } else {
        (
            nodes
                .iter()
                .filter(|n| {
                    let known = state.nodes.contains(n);
                    if !known {
                        println!("[{}] not a cluster node, skipping", n);
                    }
                    known
                })
                .cloned()
                .collect(),
            masters
                .iter()
                .filter(|m| {
                    let known = state.masters.contains(m);
                    if !known {
                        println!("[{}] not a cluster master, skipping", m);
                    }
                    known
                })
                .cloned()
                .collect::<Vec<_>>(),
        )
    };

    if target_nodes.is_empty() && target_masters.is_empty() {
        println!("nothing to clean");
        return Ok(CleanOutcome::Partial);
    }

    let prompt = if all {
        "clean will wipe the whole cluster and delete its config, continue?".to_string()
    } else {
        format!(
            "clean will remove {} node(s) and {} master(s) from the cluster, continue?",
            target_nodes.len(),
            target_masters.len()
        )
    };
    if !confirmer.confirm(&prompt)? {
        println!("clean aborted");
        return Ok(CleanOutcome::Aborted);
    }

    // Nodes first: deregistration needs a reachable API server.
    if !target_nodes.is_empty() {
        let _ = phase::run_phase_collect(&target_nodes, &|host| {
            if !all {
                deregister(fabric, state, host);
            }
            clean_host(fabric, state, host, true);
            Ok::<(), anyhow::Error>(())
        });
        state.nodes.retain(|n| !target_nodes.contains(n));
    }

    if !target_masters.is_empty() {
        // Deregister against a master that is staying, when one exists.
        let surviving = state
            .masters
            .iter()
            .find(|m| !target_masters.contains(m))
            .cloned();
        let _ = phase::run_phase_collect(&target_masters, &|host| {
            if !all {
                if let Some(ref master0) = surviving {
                    deregister_via(fabric, master0, host);
                }
            }
            clean_host(fabric, state, host, false);
            Ok::<(), anyhow::Error>(())
        });
        state.masters.retain(|m| !target_masters.contains(m));

        // The surviving nodes must stop balancing to removed masters.
        if !all && !state.masters.is_empty() {
            ipvs::refresh_all_nodes(fabric, state)?;
        }
    }

    if all {
        state.masters.clear();
        state.nodes.clear();
        println!("✓ cluster wiped");
        return Ok(CleanOutcome::WipedAll);
    }
    println!("✓ clean finished");
    Ok(CleanOutcome::Partial)
}

fn deregister(fabric: &dyn Fabric, state: &ClusterState, host: &str) {
    if let Ok(master0) = state.master0() {
        deregister_via(fabric, master0, host);
    }
}

fn deregister_via(fabric: &dyn Fabric, master0: &str, host: &str) {
    match services::registered_node_name(fabric, master0, host) {
        Ok(name) => {
            if let Err(e) = fabric.cmd(master0, &format!("kubectl delete node {}", name)) {
                eprintln!("[{}] deregistration failed: {:#}", host, e);
            }
        }
        Err(e) => eprintln!("[{}] could not resolve node name: {:#}", host, e),
    }
}

/// Wipe kubeadm, PKI, CNI and etcd state from one host. Every step is
/// best effort; a dead host must not block the rest of the teardown.
fn clean_host(fabric: &dyn Fabric, state: &ClusterState, host: &str, is_node: bool) {
    let _ = fabric.cmd(host, "kubeadm reset -f || true");
    let _ = fabric.cmd(host, "systemctl stop kubelet 2>/dev/null || true");
    let _ = fabric.cmd(
        host,
        "rm -rf /root/.kube /etc/kubernetes /etc/cni /opt/cni /var/lib/etcd /var/lib/kubelet /var/lib/cni",
    );
    let _ = fabric.cmd(host, "rm -f /root/kubeadm-config.yaml");
    if is_node {
        ipvs::clear_rules(fabric, state, host);
        let _ = ipvs::del_route(fabric, &state.vip, host);
    }
    // Keep the binary that is running this very clean.
    if !ssh::is_local_host(host) {
        let _ = fabric.cmd(host, &format!("rm -f {}", SEALOS_BIN));
    }
    println!("[{}] cleaned", host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testutil::FakeFabric;
    use crate::utils::confirm::PresetConfirmer;

    fn cluster() -> ClusterState {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into(), "10.0.0.2".into()];
        state.nodes = vec!["10.0.0.5".into(), "10.0.0.6".into()];
        state.version = "v1.21.0".into();
        state
    }

    #[test]
    fn test_clean_guard_node_listed_as_master() {
        let mut state = cluster();
        let before = state.clone();
        let fabric = FakeFabric::new();
        let err = build_clean(
            &mut state,
            &fabric,
            &[],
            &["10.0.0.1".to_string()],
            false,
            &PresetConfirmer(true),
        )
        .unwrap_err();
        assert!(err.to_string().contains("use --master"));
        assert_eq!(state, before);
        assert!(fabric.all_commands().is_empty());
    }

    #[test]
    fn test_clean_aborts_without_confirmation() {
        let mut state = cluster();
        let before = state.clone();
        let fabric = FakeFabric::new();
        let outcome = build_clean(
            &mut state,
            &fabric,
            &[],
            &["10.0.0.5".to_string()],
            false,
            &PresetConfirmer(false),
        )
        .unwrap();
        assert_eq!(outcome, CleanOutcome::Aborted);
        assert_eq!(state, before);
        assert!(fabric.all_commands().is_empty());
    }

    #[test]
    fn test_clean_node_removes_and_deregisters() {
        let mut state = cluster();
        let fabric = FakeFabric::new().respond("hostname", "node-5\n");
        let outcome = build_clean(
            &mut state,
            &fabric,
            &[],
            &["10.0.0.5".to_string()],
            false,
            &PresetConfirmer(true),
        )
        .unwrap();
        assert_eq!(outcome, CleanOutcome::Partial);
        assert_eq!(state.nodes, vec!["10.0.0.6"]);
        assert_eq!(state.masters.len(), 2);

        let m0 = fabric.commands_for("10.0.0.1").join("\n");
        assert!(m0.contains("kubectl delete node node-5"));
        let node = fabric.commands_for("10.0.0.5").join("\n");
        assert!(node.contains("kubeadm reset"));
        assert!(node.contains("ip route del"));
    }

    #[test]
    fn test_clean_master_refreshes_remaining_nodes() {
        let mut state = cluster();
        let fabric = FakeFabric::new().respond("hostname", "master-2\n");
        build_clean(
            &mut state,
            &fabric,
            &["10.0.0.2".to_string()],
            &[],
            false,
            &PresetConfirmer(true),
        )
        .unwrap();
        assert_eq!(state.masters, vec!["10.0.0.1"]);
        // Both surviving nodes re-learned the reduced master set.
        for node in ["10.0.0.5", "10.0.0.6"] {
            let cmds = fabric.commands_for(node).join("\n");
            assert!(cmds.contains("lvscare"));
        }
    }

    #[test]
    fn test_clean_all_wipes_everything() {
        let mut state = cluster();
        let fabric = FakeFabric::new();
        let outcome = build_clean(
            &mut state,
            &fabric,
            &[],
            &[],
            true,
            &PresetConfirmer(true),
        )
        .unwrap();
        assert_eq!(outcome, CleanOutcome::WipedAll);
        assert!(state.masters.is_empty());
        assert!(state.nodes.is_empty());
        // No API-server deregistration during a full wipe.
        for (_, cmd) in fabric.all_commands() {
            assert!(!cmd.contains("kubectl delete node"));
        }
        // Every host was reset.
        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.5", "10.0.0.6"] {
            let cmds = fabric.commands_for(host).join("\n");
            assert!(cmds.contains("kubeadm reset"));
        }
    }
}
