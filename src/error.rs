//! Pre-flight validation errors.
//!
//! Everything in this enum is detected before the first remote mutation.
//! The top-level command handler maps these to exit code -1; every other
//! error exits 1.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("master list is empty, please check your command")]
    MasterEmpty,

    #[error("kubernetes version is empty, please check your command")]
    VersionEmpty,

    #[error("pkg-url [{0}] is not reachable and is not a local file, please check your pkg-url")]
    PkgUrl(String),

    #[error("ip [{0}] is invalid")]
    InvalidIp(String),

    #[error("ip range [{0}] is invalid")]
    InvalidIpRange(String),

    #[error("cluster config file [{0}] not found or unparseable, please run init first")]
    Config(String),

    #[error("[{addr}] is already recorded as a {actual}, refuse to join it as a {requested}")]
    JoinRoleConflict {
        addr: String,
        actual: &'static str,
        requested: &'static str,
    },

    #[error("[{addr}] is listed under {actual}s, use --{actual} to clean it")]
    CleanRoleConflict { addr: String, actual: &'static str },

    #[error("{0}")]
    UpgradeRejected(String),
}
