//! Per-phase host fan-out.
//!
//! A workflow is a sequence of phases. Within a phase every host runs the
//! same closure on its own thread; the phase only returns once every host
//! has finished, so phase N+1 never observes a half-done phase N.

use anyhow::{Result, anyhow};
use std::thread;

/// Run `f` for every host concurrently and wait for all of them. Fails if
/// any host failed, after every host has been given the chance to finish;
/// individual errors are printed as they are collected.
pub fn run_phase<F>(name: &str, hosts: &[String], f: F) -> Result<()>
where
    F: Fn(&str) -> Result<()> + Sync,
{
    let results = run_phase_collect(hosts, &f);
    let mut failed = Vec::new();
    for (host, res) in hosts.iter().zip(results) {
        if let Err(e) = res {
            eprintln!("[{}] {} failed: {:#}", host, name, e);
            failed.push(host.clone());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("phase [{}] failed on: {}", name, failed.join(", ")))
    }
}

/// Same fan-out and barrier, but hands every host's result back to the
/// caller instead of failing. Used where partial failure is part of the
/// report (etcd health) or where cleanup must keep going.
pub fn run_phase_collect<F, R>(hosts: &[String], f: &F) -> Vec<Result<R>>
where
    F: Fn(&str) -> Result<R> + Sync,
    R: Send,
{
    if hosts.len() == 1 {
        return vec![f(&hosts[0])];
    }
    thread::scope(|scope| {
        let handles: Vec<_> = hosts
            .iter()
            .map(|host| scope.spawn(move || f(host)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(res) => res,
                Err(_) => Err(anyhow!("worker thread panicked")),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_all_hosts_run_before_return() {
        let hosts: Vec<String> = (0..8).map(|i| format!("10.0.0.{}", i)).collect();
        let seen = Mutex::new(Vec::new());
        run_phase("test", &hosts, |h| {
            seen.lock().unwrap().push(h.to_string());
            Ok(())
        })
        .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let mut want = hosts.clone();
        want.sort();
        assert_eq!(seen, want);
    }

    #[test]
    fn test_one_failure_fails_phase_but_not_siblings() {
        let hosts: Vec<String> = vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()];
        let done = Mutex::new(0);
        let err = run_phase("test", &hosts, |h| {
            if h == "10.0.0.2" {
                anyhow::bail!("boom");
            }
            *done.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(*done.lock().unwrap(), 2);
        assert!(err.to_string().contains("10.0.0.2"));
    }

    #[test]
    fn test_collect_keeps_order() {
        let hosts: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let results = run_phase_collect(&hosts, &|h| {
            if h == "b" { anyhow::bail!("nope") } else { Ok(h.to_uppercase()) }
        });
        assert_eq!(results[0].as_ref().unwrap(), "A");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), "C");
    }
}
