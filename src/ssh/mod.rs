//! Remote execution fabric.
//!
//! Everything the orchestrator does to a host goes through this module:
//! synchronous commands, fire-and-forget commands, file copy/fetch with a
//! checksum skip, existence probes and a reachability gate. The transport
//! is the system `ssh`/`scp` binaries, so host keys, agents and jump
//! configuration behave exactly as they do for an interactive session.
//! When the target address is one of the orchestrator's own addresses the
//! file operations degrade to plain filesystem copies.

use crate::config::ClusterState;
use crate::utils::iputils;
use anyhow::{Context, Result, anyhow, bail};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

const OUTPUT_LOG_LIMIT: usize = 1024;
const PING_RETRIES: u32 = 10;

/// Host-addressable execution surface the workflows are written against.
/// Implemented by [`SshClient`] for real clusters and by a recording fake
/// in tests.
pub trait Fabric: Sync {
    /// Run a command and block for its combined output. Non-zero exit is
    /// an error carrying the output tail.
    fn cmd(&self, host: &str, cmd: &str) -> Result<String>;

    /// Fire and forget. Output is only logged; the caller never sees it.
    fn cmd_async(&self, host: &str, cmd: &str) -> Result<()>;

    /// Copy a local file or directory to the host, skipping files whose
    /// remote checksum already matches.
    fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()>;

    /// Fetch a remote file, skipping the transfer when the local copy
    /// already matches.
    fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()>;

    fn is_file_exist(&self, host: &str, path: &str) -> Result<bool>;

    /// Reachability gate with bounded retries, run before anything else
    /// on a newly added host.
    fn ping(&self, host: &str) -> Result<()>;
}

/// Fabric backed by the system ssh/scp binaries.
pub struct SshClient {
    user: String,
    passwd: String,
    pkfile: String,
    local_ips: Vec<String>,
}

impl SshClient {
    pub fn from_state(state: &ClusterState) -> Self {
        SshClient {
            user: if state.user.is_empty() {
                whoami::username()
            } else {
                state.user.clone()
            },
            passwd: state.passwd.clone(),
            pkfile: state.pkfile.clone(),
            local_ips: local_ips(),
        }
    }

    fn is_local(&self, host: &str) -> bool {
        let ip = iputils::ip_format(host);
        ip == "127.0.0.1" || ip == "localhost" || self.local_ips.iter().any(|l| l == ip)
    }

    fn split_host<'a>(&self, host: &'a str) -> (&'a str, &'a str) {
        match host.split_once(':') {
            Some((ip, port)) => (ip, port),
            None => (host, "22"),
        }
    }

    /// Common ssh options. BatchMode only when no password is configured,
    /// otherwise sshpass needs the auth prompt to reach it.
    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
        ];
        if self.passwd.is_empty() {
            opts.push("-o".to_string());
            opts.push("BatchMode=yes".to_string());
        }
        if !self.pkfile.is_empty() && Path::new(&self.pkfile).exists() {
            opts.push("-i".to_string());
            opts.push(self.pkfile.clone());
        }
        opts
    }

    /// Build the command for `ssh host cmd`, wrapped in sshpass when a
    /// password is configured.
    fn ssh_command(&self, host: &str, remote_cmd: &str) -> Command {
        let (ip, port) = self.split_host(host);
        let mut args = self.ssh_options();
        args.push("-p".to_string());
        args.push(port.to_string());
        args.push(format!("{}@{}", self.user, ip));
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(shell_escape(remote_cmd));
        self.wrap_passwd("ssh", args)
    }

    fn scp_command(&self, host: &str, from: &str, to: &str, upload: bool) -> Command {
        let (ip, port) = self.split_host(host);
        let mut args = self.ssh_options();
        args.push("-P".to_string());
        args.push(port.to_string());
        if upload {
            args.push(from.to_string());
            args.push(format!("{}@{}:{}", self.user, ip, to));
        } else {
            args.push(format!("{}@{}:{}", self.user, ip, from));
            args.push(to.to_string());
        }
        self.wrap_passwd("scp", args)
    }

    fn wrap_passwd(&self, program: &str, args: Vec<String>) -> Command {
        if self.passwd.is_empty() {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        } else {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-p").arg(&self.passwd).arg(program).args(args);
            cmd
        }
    }

    /// Raw execution, exit status left to the caller.
    fn raw(&self, host: &str, remote_cmd: &str) -> Result<Output> {
        let mut cmd = self.ssh_command(host, remote_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.output()
            .with_context(|| format!("failed to run ssh to {}", host))
    }

    fn remote_sha256(&self, host: &str, path: &str) -> Option<String> {
        let out = self
            .raw(host, &format!("sha256sum {} 2>/dev/null", path))
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        stdout.split_whitespace().next().map(|s| s.to_string())
    }

    fn copy_file(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        let want = local_sha256(local)?;
        if let Some(have) = self.remote_sha256(host, remote) {
            if have == want {
                println!("[{}] {} already up to date, skip copy", host, remote);
                return Ok(());
            }
        }
        if let Some(parent) = Path::new(remote).parent() {
            let _ = self.raw(host, &format!("mkdir -p {}", parent.display()));
        }
        let out = self
            .scp_command(host, &local.display().to_string(), remote, true)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run scp to {}", host))?;
        if !out.status.success() {
            bail!(
                "copy {} -> {}:{} failed: {}",
                local.display(),
                host,
                remote,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        match self.remote_sha256(host, remote) {
            Some(have) if have == want => Ok(()),
            _ => Err(anyhow!(
                "checksum mismatch after copying {} to {}:{}",
                local.display(),
                host,
                remote
            )),
        }
    }
}

impl Fabric for SshClient {
    fn cmd(&self, host: &str, remote_cmd: &str) -> Result<String> {
        println!("[{}] {}", host, remote_cmd);
        let out = self.raw(host, remote_cmd)?;
        let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        println!("{}", truncate(&combined, OUTPUT_LOG_LIMIT));
        if !out.status.success() {
            bail!(
                "[{}] command failed (exit {}): {}\n{}",
                host,
                out.status.code().unwrap_or(1),
                remote_cmd,
                truncate(combined.trim(), OUTPUT_LOG_LIMIT)
            );
        }
        Ok(combined)
    }

    fn cmd_async(&self, host: &str, remote_cmd: &str) -> Result<()> {
        println!("[{}] (async) {}", host, remote_cmd);
        let mut cmd = self.ssh_command(host, remote_cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn ssh to {}", host))?;
        let host = host.to_string();
        // Output is only ever logged; nobody waits for this.
        std::thread::spawn(move || {
            if let Ok(out) = child.wait_with_output() {
                let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                let combined = combined.trim();
                if !combined.is_empty() {
                    println!("[{}] (async) {}", host, truncate(combined, OUTPUT_LOG_LIMIT));
                }
            }
        });
        Ok(())
    }

    fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        if self.is_local(host) {
            return local_copy(local, Path::new(remote));
        }
        if local.is_dir() {
            for entry in walk(local)? {
                let rel = entry.strip_prefix(local)?;
                let target = format!("{}/{}", remote.trim_end_matches('/'), rel.display());
                self.copy_file(host, &entry, &target)?;
            }
            Ok(())
        } else {
            self.copy_file(host, local, remote)
        }
    }

    fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
        if self.is_local(host) {
            return local_copy(Path::new(remote), local);
        }
        let have = self.remote_sha256(host, remote);
        if let (Some(remote_sum), Ok(local_sum)) = (&have, local_sha256(local)) {
            if *remote_sum == local_sum {
                println!("[{}] {} already fetched, skip", host, remote);
                return Ok(());
            }
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = self
            .scp_command(host, remote, &local.display().to_string(), false)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run scp from {}", host))?;
        if !out.status.success() {
            bail!(
                "fetch {}:{} failed: {}",
                host,
                remote,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        if let Some(remote_sum) = have {
            let local_sum = local_sha256(local)?;
            if remote_sum != local_sum {
                bail!("checksum mismatch after fetching {}:{}", host, remote);
            }
        }
        Ok(())
    }

    fn is_file_exist(&self, host: &str, path: &str) -> Result<bool> {
        if self.is_local(host) {
            return Ok(Path::new(path).exists());
        }
        let out = self.raw(host, &format!("test -f {}", path))?;
        Ok(out.status.success())
    }

    fn ping(&self, host: &str) -> Result<()> {
        for attempt in 1..=PING_RETRIES {
            match self.raw(host, "exit 0") {
                Ok(out) if out.status.success() => return Ok(()),
                _ if attempt < PING_RETRIES => {
                    println!(
                        "[{}] not reachable yet, retrying ({}/{})",
                        host, attempt, PING_RETRIES
                    );
                    std::thread::sleep(Duration::from_secs(3));
                }
                _ => {}
            }
        }
        bail!("[{}] unreachable after {} attempts", host, PING_RETRIES)
    }
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        s
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn local_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn local_copy(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if from.is_dir() {
        for entry in walk(from)? {
            let rel = entry.strip_prefix(from)?;
            let target = to.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry, &target)
                .with_context(|| format!("failed to copy {}", entry.display()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)
            .with_context(|| format!("failed to copy {}", from.display()))?;
        Ok(())
    }
}

fn walk(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(walk(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

/// Whether an address belongs to the machine driving the orchestrator.
pub fn is_local_host(host: &str) -> bool {
    let ip = iputils::ip_format(host);
    ip == "127.0.0.1" || ip == "localhost" || local_ips().iter().any(|l| l == ip)
}

/// Addresses of the machine driving the orchestrator, for the local
/// degrade path on copy/fetch.
fn local_ips() -> Vec<String> {
    let mut ips = Vec::new();
    if let Ok(out) = Command::new("hostname").arg("-I").output() {
        for ip in String::from_utf8_lossy(&out.stdout).split_whitespace() {
            ips.push(ip.to_string());
        }
    }
    if let Ok(out) = Command::new("ip").args(["-o", "addr", "show"]).output() {
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            if let Some(field) = line.split_whitespace().nth(3) {
                if let Some(ip) = field.split('/').next() {
                    if !ips.iter().any(|i| i == ip) {
                        ips.push(ip.to_string());
                    }
                }
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "héllo wörld";
        let t = truncate(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("echo hi"), "'echo hi'");
        assert_eq!(shell_escape("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_local_sha256_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello").unwrap();
        let sum = local_sha256(&src).unwrap();
        assert_eq!(
            sum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let dst = dir.path().join("nested/b.txt");
        local_copy(&src, &dst).unwrap();
        assert_eq!(local_sha256(&dst).unwrap(), sum);
    }

    #[test]
    fn test_local_copy_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pki");
        fs::create_dir_all(src.join("etcd")).unwrap();
        fs::write(src.join("ca.crt"), b"ca").unwrap();
        fs::write(src.join("etcd").join("ca.crt"), b"etcd-ca").unwrap();

        let dst = dir.path().join("out");
        local_copy(&src, &dst).unwrap();
        assert!(dst.join("ca.crt").exists());
        assert!(dst.join("etcd").join("ca.crt").exists());
    }
}
