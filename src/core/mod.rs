//! Core firewall policy functionality
//!
//! - [`ruleset`]: In-memory tables, chains, sets and rules with an operation journal
//! - [`expr`] and [`matches`]: Register-level expressions and the builders that emit them
//! - [`transaction`]: Ships the journal to a backend as one atomic batch
//! - [`backend`]: The backend trait, the `nft` driver and an in-memory stand-in
//! - [`nft_json`]: nftables JSON encoding and decoding
//! - [`policy`]: The kill-switch / split-tunnel policy engine
//! - [`simulate`]: Evaluates modeled chains against synthetic packets
//! - [`verify`]: Batch checking with `nft --check`
//! - [`error`]: Error types

pub mod backend;
pub mod error;
pub mod expr;
pub mod matches;
pub mod nft_json;
pub mod policy;
pub mod ruleset;
pub mod simulate;
pub mod transaction;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
