pub mod confirm;
pub mod iputils;
pub mod phase;
pub mod versionutil;
