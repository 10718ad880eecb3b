//! Kubernetes version arithmetic.
//!
//! Versions come in as `v1.19.1` style strings. Comparisons work on the
//! combined major+minor number (`v1.19.x` -> 119) with the patch kept
//! separately, which is how the upgrade gate reasons about minor steps.

use crate::error::PreflightError;

/// `v1.19.1` -> 1191. Returns 0 for anything unparseable.
pub fn to_int_all(version: &str) -> u32 {
    let v = version.trim_start_matches('v');
    let parts: Vec<&str> = v.split('.').collect();
    if parts.len() < 3 {
        return 0;
    }
    format!("{}{}{}", parts[0], parts[1], parts[2])
        .parse()
        .unwrap_or(0)
}

/// Combined major+minor and the patch level, pre-release suffix stripped.
/// `v1.20.0-rc.1` -> (120, 0). Returns (0, 0) for anything unparseable.
pub fn major_minor(version: &str) -> (u32, u32) {
    let v = version.split('-').next().unwrap_or(version);
    let v = v.trim_start_matches('v');
    let parts: Vec<&str> = v.split('.').collect();
    if parts.len() < 3 {
        return (0, 0);
    }
    let major = format!("{}{}", parts[0], parts[1]).parse().unwrap_or(0);
    let patch = parts[2].parse().unwrap_or(0);
    (major, patch)
}

/// Outcome of a passed upgrade gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeVerdict {
    /// The 1.19 -> 1.20 boundary, where the container runtime moves from
    /// docker to containerd. Allowed, but the caller must surface it as a
    /// hard requirement on the hosts.
    pub cri_switch: bool,
}

/// Gate for `upgrade`: rejects downgrades, same-version no-ops and jumps
/// of more than one minor version. Everything is decided before any SSH
/// call is made.
pub fn can_upgrade(new: &str, old: &str) -> Result<UpgradeVerdict, PreflightError> {
    let (new_major, new_patch) = major_minor(new);
    let (old_major, old_patch) = major_minor(old);

    if new_major < old_major {
        return Err(PreflightError::UpgradeRejected(format!(
            "new version is lower than current version, new: {}, current: {}",
            new, old
        )));
    }
    if new_major == old_major && new_patch <= old_patch {
        return Err(PreflightError::UpgradeRejected(format!(
            "new version is lower than or equal to current version, new: {}, current: {}",
            new, old
        )));
    }
    if new_major > old_major + 1 {
        return Err(PreflightError::UpgradeRejected(format!(
            "skipping more than one minor version is not allowed, new: {}, current: {}",
            new, old
        )));
    }

    Ok(UpgradeVerdict {
        cri_switch: new_major == 120 && old_major == 119,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_int_all() {
        assert_eq!(to_int_all("v1.19.1"), 1191);
        assert_eq!(to_int_all("1.15.6"), 1156);
        assert_eq!(to_int_all("v1.19"), 0);
        assert_eq!(to_int_all("garbage"), 0);
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(major_minor("v1.20.0-rc.1"), (120, 0));
        assert_eq!(major_minor("v1.19.8"), (119, 8));
        assert_eq!(major_minor("v1.23.4"), (123, 4));
    }

    #[test]
    fn test_upgrade_allowed() {
        let v = can_upgrade("v1.18.0", "v1.17.5").unwrap();
        assert!(!v.cri_switch);
    }

    #[test]
    fn test_upgrade_rejects_downgrade() {
        assert!(can_upgrade("v1.17.0", "v1.18.0").is_err());
        assert!(can_upgrade("v1.18.1", "v1.18.1").is_err());
    }

    #[test]
    fn test_upgrade_rejects_minor_jump() {
        assert!(can_upgrade("v1.20.0", "v1.17.0").is_err());
        assert!(can_upgrade("v1.20.0", "v1.18.3").is_err());
    }

    #[test]
    fn test_upgrade_flags_cri_switch() {
        let v = can_upgrade("v1.20.0", "v1.19.5").unwrap();
        assert!(v.cri_switch);
    }
}
