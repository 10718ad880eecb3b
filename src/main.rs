use anyhow::Result;
use clap::{Parser, Subcommand};
use sealos::cert::{self, KubeadmCertGenerator};
use sealos::config::{self, ClusterState};
use sealos::error::PreflightError;
use sealos::ipvs;
use sealos::services::{clean, etcd, exec, init, join, upgrade};
use sealos::ssh::SshClient;
use sealos::utils::confirm::{Confirmer, PresetConfirmer, StdinConfirmer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sealos")]
#[command(about = "Bootstrap, scale, upgrade and repair an HA kubernetes cluster over SSH", long_about = None)]
struct Cli {
    /// Cluster state file (default ~/.sealos/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap a new HA cluster on the given masters and nodes
    Init {
        /// Master addresses (comma lists and ranges like 192.168.0.2-192.168.0.4)
        #[arg(long = "master")]
        masters: Vec<String>,
        /// Node addresses
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Virtual IP fronting the API server
        #[arg(long)]
        vip: Option<String>,
        #[arg(long)]
        podcidr: Option<String>,
        #[arg(long)]
        svccidr: Option<String>,
        /// Kubernetes version, e.g. v1.21.0
        #[arg(long)]
        version: Option<String>,
        /// Offline package location (http(s) URL or local file)
        #[arg(long = "pkg-url")]
        pkg_url: Option<String>,
        /// Extra API server certificate SANs
        #[arg(long = "cert-sans")]
        cert_sans: Vec<String>,
        #[arg(long)]
        repo: Option<String>,
        /// SSH user for all hosts
        #[arg(long)]
        user: Option<String>,
        /// SSH password, keys are used when empty
        #[arg(long)]
        passwd: Option<String>,
        /// SSH private key file
        #[arg(long = "pk")]
        pkfile: Option<String>,
        /// Custom kubeadm config template rendered with the cluster variables
        #[arg(long = "kubeadm-config")]
        kubeadm_config: Option<PathBuf>,
        /// CNI interface hint, an IP means can-reach
        #[arg(long)]
        interface: Option<String>,
        /// Skip network plugin installation
        #[arg(long = "without-cni")]
        without_cni: bool,
    },
    /// Join masters and/or nodes to the running cluster
    Join {
        #[arg(long = "master")]
        masters: Vec<String>,
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// Remove members from the cluster, or wipe it entirely
    Clean {
        #[arg(long = "master")]
        masters: Vec<String>,
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Wipe every member and delete the cluster config
        #[arg(long)]
        all: bool,
        /// Skip the interactive confirmation
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Upgrade the cluster to a new kubernetes version, masters first
    Upgrade {
        #[arg(long)]
        version: String,
        /// Offline package for the new version
        #[arg(long = "pkg-url")]
        pkg_url: Option<String>,
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Regenerate the cluster certificates with extra SANs
    Cert {
        #[arg(long = "alt-names")]
        alt_names: Vec<String>,
    },
    /// Etcd snapshot, restore and health
    Etcd {
        #[command(subcommand)]
        command: EtcdCommands,
    },
    /// Manage the host route to the cluster VIP on this machine
    Route {
        #[command(subcommand)]
        command: RouteCommands,
    },
    /// Run a command on a host selection (defaults to every member)
    Exec {
        #[arg(long)]
        cmd: String,
        #[arg(long = "master")]
        masters: Vec<String>,
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// Print a fully populated example cluster config
    Config,
}

#[derive(Subcommand)]
enum EtcdCommands {
    /// Snapshot etcd from the bootstrap master and fan the file out
    Save {
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "backup-dir")]
        backup_dir: Option<String>,
        /// Pre-authorized HTTP PUT destination for the snapshot
        #[arg(long = "upload-url")]
        upload_url: Option<String>,
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Restore the whole cluster from a snapshot
    Restore {
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "backup-dir")]
        backup_dir: Option<String>,
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Report per-endpoint etcd health
    Health,
}

#[derive(Subcommand)]
enum RouteCommands {
    /// Route the VIP through this host's own address
    Add {
        #[arg(long)]
        host: String,
        #[arg(long)]
        gateway: String,
    },
    /// Drop the VIP route
    Del {
        #[arg(long)]
        host: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        if e.downcast_ref::<PreflightError>().is_some() {
            std::process::exit(-1);
        }
        std::process::exit(1);
    }
}

fn config_path(cli_config: &Option<PathBuf>) -> PathBuf {
    cli_config
        .clone()
        .unwrap_or_else(config::default_config_path)
}

fn confirmer(force: bool) -> Box<dyn Confirmer> {
    if force {
        Box::new(PresetConfirmer(true))
    } else {
        Box::new(StdinConfirmer)
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = config_path(&cli.config);
    match cli.command {
        Commands::Init {
            masters,
            nodes,
            vip,
            podcidr,
            svccidr,
            version,
            pkg_url,
            cert_sans,
            repo,
            user,
            passwd,
            pkfile,
            kubeadm_config,
            interface,
            without_cni,
        } => {
            // Starting fresh unless a state file already exists.
            let mut state = ClusterState::load(&path).unwrap_or_default();
            if !masters.is_empty() {
                state.masters = masters;
            }
            if !nodes.is_empty() {
                state.nodes = nodes;
            }
            set_if(&mut state.vip, vip);
            set_if(&mut state.podcidr, podcidr);
            set_if(&mut state.svccidr, svccidr);
            set_if(&mut state.version, version);
            set_if(&mut state.pkgurl, pkg_url);
            set_if(&mut state.repo, repo);
            set_if(&mut state.user, user);
            set_if(&mut state.passwd, passwd);
            set_if(&mut state.pkfile, pkfile);
            if !cert_sans.is_empty() {
                state.apiservercertsans = cert_sans;
            }

            let fabric = SshClient::from_state(&state);
            let opts = init::InitOptions {
                kubeadm_template: kubeadm_config,
                interface: interface.unwrap_or_default(),
                without_cni,
            };
            init::build_init(&mut state, &fabric, &KubeadmCertGenerator, &opts)?;
            state.dump(&path)?;
            println!("✓ cluster state saved to {}", path.display());
            Ok(())
        }
        Commands::Join { masters, nodes } => {
            let mut state = ClusterState::load(&path)?;
            let fabric = SshClient::from_state(&state);
            join::build_join(&mut state, &fabric, &masters, &nodes)?;
            state.dump(&path)?;
            Ok(())
        }
        Commands::Clean {
            masters,
            nodes,
            all,
            force,
        } => {
            let mut state = ClusterState::load(&path)?;
            let fabric = SshClient::from_state(&state);
            match clean::build_clean(
                &mut state,
                &fabric,
                &masters,
                &nodes,
                all,
                confirmer(force).as_ref(),
            )? {
                clean::CleanOutcome::WipedAll => {
                    let _ = std::fs::remove_file(&path);
                    println!("cluster config {} removed", path.display());
                }
                clean::CleanOutcome::Partial => state.dump(&path)?,
                clean::CleanOutcome::Aborted => {}
            }
            Ok(())
        }
        Commands::Upgrade {
            version,
            pkg_url,
            force,
        } => {
            let mut state = ClusterState::load(&path)?;
            let fabric = SshClient::from_state(&state);
            upgrade::build_upgrade(
                &mut state,
                &fabric,
                &version,
                pkg_url.as_deref(),
                confirmer(force).as_ref(),
            )?;
            state.dump(&path)?;
            Ok(())
        }
        Commands::Cert { alt_names } => {
            let mut state = ClusterState::load(&path)?;
            let fabric = SshClient::from_state(&state);
            cert::update_cluster_certs(&mut state, &fabric, &KubeadmCertGenerator, &alt_names)?;
            state.dump(&path)?;
            Ok(())
        }
        Commands::Etcd { command } => match command {
            EtcdCommands::Save {
                name,
                backup_dir,
                upload_url,
                force,
            } => {
                let mut state = ClusterState::load(&path)?;
                let fabric = SshClient::from_state(&state);
                let snap = etcd::EtcdSnapshot::new(
                    &state,
                    name.as_deref(),
                    backup_dir.as_deref(),
                    upload_url.as_deref(),
                )?;
                if !confirmer(force)
                    .confirm(&format!("save etcd snapshot [{}] now?", snap.name))?
                {
                    println!("save aborted");
                    return Ok(());
                }
                etcd::save(&mut state, &fabric, &snap)?;
                state.dump(&path)?;
                Ok(())
            }
            EtcdCommands::Restore {
                name,
                backup_dir,
                force,
            } => {
                let state = ClusterState::load(&path)?;
                let fabric = SshClient::from_state(&state);
                let name = name.or_else(|| {
                    (!state.snapshotname.is_empty()).then(|| state.snapshotname.clone())
                });
                let backup_dir = backup_dir.or_else(|| {
                    (!state.etcdbackupdir.is_empty()).then(|| state.etcdbackupdir.clone())
                });
                let snap = etcd::EtcdSnapshot::new(
                    &state,
                    name.as_deref(),
                    backup_dir.as_deref(),
                    None,
                )?;
                etcd::restore(&state, &fabric, &snap, confirmer(force).as_ref())
            }
            EtcdCommands::Health => {
                let state = ClusterState::load(&path)?;
                let fabric = SshClient::from_state(&state);
                let report = etcd::health_check(&fabric, &state)?;
                etcd::print_report(&report);
                Ok(())
            }
        },
        Commands::Route { command } => match command {
            RouteCommands::Add { host, gateway } => ipvs::local_route_add(&host, &gateway),
            RouteCommands::Del { host } => ipvs::local_route_del(&host),
        },
        Commands::Exec {
            cmd,
            masters,
            nodes,
        } => {
            let state = ClusterState::load(&path)?;
            let fabric = SshClient::from_state(&state);
            exec::exec_cmd(&state, &fabric, &cmd, &masters, &nodes)
        }
        Commands::Config => {
            print!("{}", ClusterState::default_config());
            Ok(())
        }
    }
}

fn set_if(slot: &mut String, value: Option<String>) {
    if let Some(v) = value {
        if !v.is_empty() {
            *slot = v;
        }
    }
}
