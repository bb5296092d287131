//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::backend::memory::MemoryBackend;
use crate::core::policy::PolicyEngine;
use crate::core::simulate::Packet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("TUNWALL_NFT_COMMAND");
///     std::env::set_var("TUNWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("TUNWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub const TEST_FWMARK: u32 = 0xca6c;
pub const TEST_IFNAME: &str = "wg0";
pub const TEST_SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

/// Engine with baseline tables, the test mark and the kill-switch allow-list.
pub fn restricted_engine() -> PolicyEngine<MemoryBackend> {
    let mut engine = PolicyEngine::new(MemoryBackend::new());
    engine.create_baseline().unwrap();
    engine.apply_fwmark(TEST_FWMARK).unwrap();
    engine.restrict_traffic(TEST_IFNAME).unwrap();
    engine
}

/// Rule count of every chain in the model, in chain creation order.
pub fn chain_rule_counts(engine: &PolicyEngine<MemoryBackend>) -> Vec<usize> {
    let rs = engine.ruleset();
    rs.tables()
        .flat_map(|(_, t)| t.chains.iter())
        .filter_map(|&c| rs.chain(c))
        .map(|c| c.rules.len())
        .collect()
}

/// Outgoing UDP from the LAN address to `dst` through `eth0`.
pub fn lan_udp_out(dst: Ipv4Addr, dport: u16) -> Packet {
    Packet::udp_v4(Ipv4Addr::new(192, 168, 1, 10), 40000, dst, dport).outbound("eth0")
}

/// Incoming UDP from `src` on `eth0`.
pub fn lan_udp_in(src: Ipv4Addr, sport: u16) -> Packet {
    Packet::udp_v4(src, sport, Ipv4Addr::new(192, 168, 1, 10), 40000).inbound("eth0")
}
