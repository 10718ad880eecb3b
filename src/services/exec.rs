//! Ad-hoc command fan-out.
//!
//! Runs one shell command across a host selection, printing each host's
//! output. A failing host is reported but never stops the rest.

use crate::config::ClusterState;
use crate::ssh::Fabric;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::Result;

/// Resolve the target set: explicit lists win, otherwise every host.
pub fn select_hosts(
    state: &ClusterState,
    masters: &[String],
    nodes: &[String],
) -> Result<Vec<String>> {
    let masters = iputils::parse_ips(masters)?;
    let nodes = iputils::parse_ips(nodes)?;
    let mut hosts: Vec<String> = masters;
    hosts.extend(nodes);
    if hosts.is_empty() {
        hosts = state.all_hosts();
    }
    Ok(hosts)
}

pub fn exec_cmd(
    state: &ClusterState,
    fabric: &dyn Fabric,
    command: &str,
    masters: &[String],
    nodes: &[String],
) -> Result<()> {
    let hosts = select_hosts(state, masters, nodes)?;
    if hosts.is_empty() {
        println!("no hosts to run on");
        return Ok(());
    }
    let results = phase::run_phase_collect(&hosts, &|host| fabric.cmd(host, command));
    let mut failures = 0;
    for (host, res) in hosts.iter().zip(results) {
        match res {
            Ok(output) => println!("[{}]\n{}", host, output.trim_end()),
            Err(e) => {
                failures += 1;
                eprintln!("[{}] failed: {:#}", host, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("command failed on {} of {} host(s)", failures, hosts.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testutil::FakeFabric;

    fn cluster() -> ClusterState {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into()];
        state.nodes = vec!["10.0.0.2".into()];
        state
    }

    #[test]
    fn test_select_defaults_to_all_hosts() {
        let state = cluster();
        let hosts = select_hosts(&state, &[], &[]).unwrap();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);

        let hosts = select_hosts(&state, &[], &["10.0.0.9".to_string()]).unwrap();
        assert_eq!(hosts, vec!["10.0.0.9"]);
    }

    #[test]
    fn test_exec_continues_past_failures() {
        let state = cluster();
        let fabric = FakeFabric::new().fail_on("10.0.0.1");
        let err = exec_cmd(&state, &fabric, "uptime", &[], &[]).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert_eq!(fabric.commands_for("10.0.0.2").len(), 1);
    }
}
