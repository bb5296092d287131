//! tunwall - kill switch and split tunnel firewall for VPN clients
//!
//! Compiles tunnel policy (default-deny filtering, excluded process groups,
//! server address sets, DHCP/DNS/NDP handling) into nftables rules and applies
//! them atomically through `nft --json`.
//!
//! # Architecture
//!
//! - [`core`] - Rule-set model, match builders, policy engine and nftables backends
//! - [`killswitch`] - Tunnel up/down sequencing on top of the policy engine
//! - [`audit`] - Audit log of privileged operations
//! - [`validators`] - Input validation
//! - [`config`] - Tunnel configuration persistence
//! - [`elevation`] - Privilege escalation for the `nft` binary
//! - [`utils`] - XDG directories
//!
//! # Safety Features
//!
//! - Input validated before any rule is built
//! - Default `drop` policy on the filter chains, so a failed allow fails closed
//! - One nft transaction per operation
//! - Optional pre-apply verification with `nft --check`
//! - SHA-256 fingerprints of applied batches in the audit log

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod killswitch;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result, status};
pub use core::policy::PolicyEngine;
pub use killswitch::KillSwitch;
