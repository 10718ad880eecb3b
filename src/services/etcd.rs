//! Etcd snapshot, restore and health reporting.
//!
//! A snapshot is requested from exactly one member (the bootstrap
//! master's endpoint) with the cluster's TLS client certs, then fanned
//! out to every master's backup directory so any of them can seed a
//! restore. Restore is the most destructive operation in the system: the
//! control-plane static pods are stopped by moving their manifests aside,
//! and if anything fails after that point the moved manifests are put
//! back so the node is never left without a control plane.

use crate::config::ClusterState;
use crate::ssh::Fabric;
use crate::utils::confirm::Confirmer;
use crate::utils::iputils;
use crate::utils::phase;
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const ETCD_CACERT: &str = "/etc/kubernetes/pki/etcd/ca.crt";
pub const ETCD_CERT: &str = "/etc/kubernetes/pki/etcd/healthcheck-client.crt";
pub const ETCD_KEY: &str = "/etc/kubernetes/pki/etcd/healthcheck-client.key";

const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
const MANIFESTS_BACKUP: &str = "/etc/kubernetes/manifests.bak";
const ETCD_DATA_DIR: &str = "/var/lib/etcd";
pub const DEFAULT_BACKUP_DIR: &str = "/opt/sealos/etcd-backup";

const RESTORE_SETTLE: Duration = Duration::from_secs(60);
const HEALTH_POLL_TRIES: u32 = 12;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One save/restore request, built from the state plus command flags.
#[derive(Debug, Clone)]
pub struct EtcdSnapshot {
    pub name: String,
    pub backup_dir: String,
    /// One endpoint per master; snapshots only ever talk to the first.
    pub endpoints: Vec<String>,
    pub upload_url: Option<String>,
}

impl EtcdSnapshot {
    pub fn new(
        state: &ClusterState,
        name: Option<&str>,
        backup_dir: Option<&str>,
        upload_url: Option<&str>,
    ) -> Result<Self> {
        state.master0()?;
        let name = match name {
            Some(n) => n.to_string(),
            None => format!(
                "snapshot-{}",
                chrono::Utc::now().format("%Y%m%d-%H%M%S")
            ),
        };
        Ok(EtcdSnapshot {
            name,
            backup_dir: backup_dir.unwrap_or(DEFAULT_BACKUP_DIR).to_string(),
            endpoints: state
                .master_ips()
                .iter()
                .map(|ip| format!("https://{}:2379", ip))
                .collect(),
            upload_url: upload_url.map(|s| s.to_string()),
        })
    }

    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.backup_dir.trim_end_matches('/'), self.name)
    }

    fn staging_path(&self) -> PathBuf {
        crate::services::work_dir().join("etcd-backup").join(&self.name)
    }
}

fn etcdctl_tls_flags() -> String {
    format!(
        "--cacert {} --cert {} --key {}",
        ETCD_CACERT, ETCD_CERT, ETCD_KEY
    )
}

/// Take a snapshot, fan it out, optionally upload it, then report
/// cluster health per endpoint.
pub fn save(state: &mut ClusterState, fabric: &dyn Fabric, snap: &EtcdSnapshot) -> Result<()> {
    let master0 = state.master0()?.to_string();
    let endpoint = snap
        .endpoints
        .first()
        .context("no etcd endpoint to snapshot from")?;

    println!("saving etcd snapshot [{}] from {}", snap.name, endpoint);
    fabric
        .cmd(
            &master0,
            &format!(
                "ETCDCTL_API=3 etcdctl snapshot save /tmp/{name} --endpoints {ep} {tls}",
                name = snap.name,
                ep = endpoint,
                tls = etcdctl_tls_flags()
            ),
        )
        .context("etcd snapshot failed")?;

    let staging = snap.staging_path();
    fabric.fetch(&master0, &format!("/tmp/{}", snap.name), &staging)?;

    let masters = state.masters.clone();
    phase::run_phase("distribute snapshot", &masters, |host| {
        fabric.cmd(host, &format!("mkdir -p {}", snap.backup_dir))?;
        fabric.copy(host, &staging, &snap.remote_path())
    })?;

    if let Some(url) = &snap.upload_url {
        upload(&staging, url)?;
    }

    state.snapshotname = snap.name.clone();
    state.etcdbackupdir = snap.backup_dir.clone();

    let report = health_check(fabric, state)?;
    print_report(&report);
    Ok(())
}

fn upload(staging: &PathBuf, url: &str) -> Result<()> {
    println!("uploading snapshot to {}", url);
    let file = std::fs::File::open(staging)
        .with_context(|| format!("snapshot staging file {} missing", staging.display()))?;
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?;
    let resp = client.put(url).body(file).send().context("upload failed")?;
    if !resp.status().is_success() {
        bail!("upload failed with status {}", resp.status());
    }
    println!("✓ snapshot uploaded");
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub healthy: bool,
    pub took: String,
    pub error: String,
}

/// Probe every configured endpoint concurrently from the bootstrap
/// master. Partial failure is part of the report, never an abort.
pub fn health_check(fabric: &dyn Fabric, state: &ClusterState) -> Result<Vec<EndpointHealth>> {
    let master0 = state.master0()?.to_string();
    let endpoints: Vec<String> = state
        .master_ips()
        .iter()
        .map(|ip| format!("https://{}:2379", ip))
        .collect();
    let took_re = Regex::new(r"took\s*=\s*(\S+)").unwrap();

    let results = phase::run_phase_collect(&endpoints, &|endpoint| {
        let start = Instant::now();
        let out = fabric.cmd(
            &master0,
            &format!(
                "ETCDCTL_API=3 etcdctl endpoint health --endpoints {} {}",
                endpoint,
                etcdctl_tls_flags()
            ),
        )?;
        Ok((out, start.elapsed()))
    });

    Ok(endpoints
        .iter()
        .zip(results)
        .map(|(endpoint, res)| match res {
            Ok((out, elapsed)) => {
                let healthy = out.contains("is healthy");
                let took = took_re
                    .captures(&out)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| format!("{}ms", elapsed.as_millis()));
                EndpointHealth {
                    endpoint: endpoint.clone(),
                    healthy,
                    took,
                    error: if healthy { String::new() } else { out.trim().to_string() },
                }
            }
            Err(e) => EndpointHealth {
                endpoint: endpoint.clone(),
                healthy: false,
                took: String::new(),
                error: format!("{:#}", e),
            },
        })
        .collect())
}

pub fn print_report(report: &[EndpointHealth]) {
    for entry in report {
        if entry.healthy {
            println!("✓ {} healthy, took {}", entry.endpoint, entry.took);
        } else {
            println!("✗ {} unhealthy: {}", entry.endpoint, entry.error);
        }
    }
}

/// Restore the whole cluster from a snapshot.
pub fn restore(
    state: &ClusterState,
    fabric: &dyn Fabric,
    snap: &EtcdSnapshot,
    confirmer: &dyn Confirmer,
) -> Result<()> {
    if !confirmer.confirm(
        "etcd restore stops the whole control plane and overwrites its data, continue?",
    )? {
        println!("restore aborted");
        return Ok(());
    }

    let masters = state.masters.clone();
    let staging = resolve_snapshot(state, fabric, snap)?;

    // Member names and peer URLs for the rebuilt cluster.
    let mut members = Vec::new();
    for master in &masters {
        let name = crate::services::remote_hostname(fabric, master)?;
        members.push((master.clone(), name));
    }
    let initial_cluster = members
        .iter()
        .map(|(host, name)| {
            format!("etcd-{}=https://{}:2380", name, iputils::ip_format(host))
        })
        .collect::<Vec<_>>()
        .join(",");

    println!("stopping control-plane static pods on all masters");
    phase::run_phase("stop control plane", &masters, |host| {
        fabric.cmd(
            host,
            &format!("mv {} {}", MANIFESTS_DIR, MANIFESTS_BACKUP),
        )?;
        Ok(())
    })?;

    // From here on a failure must not leave the node without a control
    // plane: put the old manifests back and report the recovery.
    if let Err(e) = restore_members(fabric, snap, &staging, &members, &initial_cluster) {
        eprintln!("✗ restore failed: {:#}", e);
        eprintln!("Start RecoveryKuBeCluster: moving previous control-plane manifests back");
        let _ = phase::run_phase_collect(&masters, &|host| {
            fabric.cmd(
                host,
                &format!(
                    "[ -d {bak} ] && [ ! -d {dir} ] && mv {bak} {dir} || true",
                    bak = MANIFESTS_BACKUP,
                    dir = MANIFESTS_DIR
                ),
            )
        });
        return Err(e.context("etcd restore failed, previous control plane was recovered"));
    }

    println!(
        "control plane restarted, waiting {}s before the health check",
        RESTORE_SETTLE.as_secs()
    );
    std::thread::sleep(RESTORE_SETTLE);

    for attempt in 1..=HEALTH_POLL_TRIES {
        let report = health_check(fabric, state)?;
        if report.iter().all(|e| e.healthy) {
            print_report(&report);
            println!("✓ etcd restore finished, cluster is healthy");
            return Ok(());
        }
        if attempt < HEALTH_POLL_TRIES {
            std::thread::sleep(HEALTH_POLL_INTERVAL);
        } else {
            print_report(&report);
        }
    }
    bail!("cluster did not become healthy after restore, inspect the etcd static pods")
}

fn restore_members(
    fabric: &dyn Fabric,
    snap: &EtcdSnapshot,
    staging: &PathBuf,
    members: &[(String, String)],
    initial_cluster: &str,
) -> Result<()> {
    let hosts: Vec<String> = members.iter().map(|(h, _)| h.clone()).collect();

    phase::run_phase("restore etcd data", &hosts, |host| {
        let name = members
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, n)| n.clone())
            .unwrap_or_default();
        let ip = iputils::ip_format(host);
        fabric.copy(host, staging, &format!("/tmp/{}", snap.name))?;
        fabric.cmd(host, &format!("rm -rf {}", ETCD_DATA_DIR))?;
        fabric.cmd(
            host,
            &format!(
                "ETCDCTL_API=3 etcdctl snapshot restore /tmp/{snapname} \
                 --name etcd-{name} --initial-cluster {ic} \
                 --initial-cluster-token sealos-etcd-cluster \
                 --initial-advertise-peer-urls https://{ip}:2380 \
                 --data-dir {data}",
                snapname = snap.name,
                name = name,
                ic = initial_cluster,
                ip = ip,
                data = ETCD_DATA_DIR
            ),
        )?;
        Ok(())
    })?;

    phase::run_phase("restart control plane", &hosts, |host| {
        fabric.cmd(
            host,
            &format!("mv {} {}", MANIFESTS_BACKUP, MANIFESTS_DIR),
        )?;
        Ok(())
    })
}

/// Locate the snapshot file locally, fetching it from the bootstrap
/// master's backup directory when the staging copy is gone.
fn resolve_snapshot(
    state: &ClusterState,
    fabric: &dyn Fabric,
    snap: &EtcdSnapshot,
) -> Result<PathBuf> {
    let staging = snap.staging_path();
    if staging.exists() {
        return Ok(staging);
    }
    let master0 = state.master0()?;
    println!(
        "snapshot not staged locally, fetching {} from {}",
        snap.remote_path(),
        master0
    );
    fabric
        .fetch(master0, &snap.remote_path(), &staging)
        .with_context(|| format!("snapshot [{}] not found", snap.name))?;
    Ok(staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testutil::FakeFabric;
    use crate::utils::confirm::PresetConfirmer;

    fn cluster() -> ClusterState {
        let mut state = ClusterState::default();
        state.masters = vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()];
        state.version = "v1.21.0".into();
        state
    }

    #[test]
    fn test_snapshot_defaults() {
        let state = cluster();
        let snap = EtcdSnapshot::new(&state, Some("snap-1"), None, None).unwrap();
        assert_eq!(snap.remote_path(), "/opt/sealos/etcd-backup/snap-1");
        assert_eq!(snap.endpoints.len(), 3);
        assert_eq!(snap.endpoints[0], "https://10.0.0.1:2379");

        let auto = EtcdSnapshot::new(&state, None, Some("/backups/"), None).unwrap();
        assert!(auto.name.starts_with("snapshot-"));
        assert_eq!(auto.backup_dir, "/backups/");
    }

    #[test]
    fn test_save_snapshots_from_exactly_one_endpoint() {
        let mut state = cluster();
        let fabric = FakeFabric::new().respond(
            "endpoint health",
            "https://x:2379 is healthy: successfully committed proposal: took = 1.2ms",
        );
        let snap = EtcdSnapshot::new(&state, Some("snap-1"), None, None).unwrap();
        save(&mut state, &fabric, &snap).unwrap();

        let saves: Vec<_> = fabric
            .all_commands()
            .into_iter()
            .filter(|(_, c)| c.contains("snapshot save"))
            .collect();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].0, "10.0.0.1");
        assert!(saves[0].1.contains("--endpoints https://10.0.0.1:2379"));
        assert!(saves[0].1.contains("--cacert"));

        // Fanned out to every master's backup dir.
        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let cmds = fabric.commands_for(host).join("\n");
            assert!(cmds.contains("/opt/sealos/etcd-backup/snap-1"));
        }
        assert_eq!(state.snapshotname, "snap-1");
    }

    #[test]
    fn test_health_report_with_one_unreachable_endpoint() {
        let state = cluster();
        let fabric = FakeFabric::new()
            .fail_on("https://10.0.0.3:2379")
            .respond(
                "endpoint health",
                "https://x:2379 is healthy: successfully committed proposal: took = 9.76ms",
            );
        let report = health_check(&fabric, &state).unwrap();
        assert_eq!(report.len(), 3);
        assert!(report[0].healthy);
        assert_eq!(report[0].took, "9.76ms");
        assert!(report[1].healthy);
        assert!(!report[2].healthy);
        assert!(!report[2].error.is_empty());
        assert_eq!(report.iter().filter(|e| !e.healthy).count(), 1);
    }

    #[test]
    fn test_restore_recovery_puts_manifests_back() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SEALOS_HOME", dir.path());
        let state = cluster();
        let snap = EtcdSnapshot::new(&state, Some("snap-1"), None, None).unwrap();
        // Stage the snapshot so restore does not need to fetch it.
        std::fs::create_dir_all(snap.staging_path().parent().unwrap()).unwrap();
        std::fs::write(snap.staging_path(), b"snapshot").unwrap();

        let fabric = FakeFabric::new()
            .respond("hostname", "m\n")
            .fail_on("snapshot restore");
        let err = restore(&state, &fabric, &snap, &PresetConfirmer(true)).unwrap_err();
        assert!(err.to_string().contains("recovered"));

        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let cmds = fabric.commands_for(host).join("\n");
            // Stopped, then moved back by the recovery branch.
            assert!(cmds.contains(&format!("mv {} {}", MANIFESTS_DIR, MANIFESTS_BACKUP)));
            assert!(cmds.contains(&format!("mv {} {}", MANIFESTS_BACKUP, MANIFESTS_DIR)));
        }
    }

    #[test]
    fn test_restore_declined_is_a_noop() {
        let state = cluster();
        let snap = EtcdSnapshot::new(&state, Some("snap-1"), None, None).unwrap();
        let fabric = FakeFabric::new();
        restore(&state, &fabric, &snap, &PresetConfirmer(false)).unwrap();
        assert!(fabric.all_commands().is_empty());
    }
}
