//! Integration tests for tunwall
//!
//! These tests drive the public API end to end: config loading, the kill
//! switch lifecycle, batch rendering, verification and packet simulation.
//!
//! # Running with Mock
//!
//! The `nft` backend tests run `tests/mock_nft.sh` through `sh`, so no
//! privileges or nftables installation are needed:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tunwall::config::{TunnelConfig, load_config, save_config};
use tunwall::core::backend::memory::MemoryBackend;
use tunwall::core::backend::nft::NftBackend;
use tunwall::core::error::NftablesErrorPattern;
use tunwall::core::nft_json::{fingerprint, render_batch};
use tunwall::core::policy::{CHAIN_OUTPUT, table_ref};
use tunwall::core::ruleset::Hook;
use tunwall::core::simulate::{Decision, Packet, evaluate_hook};
use tunwall::core::verify::verify_batch;
use tunwall::{Error, KillSwitch};

const PERMISSION_DENIED: &str = "Error: Could not process rule: Operation not permitted\n";

/// Get the path to the mock nft script
fn get_mock_nft_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("mock_nft.sh");
    path
}

/// Backend running the mock with its state kept in `state`
fn mock_backend(state: &Path) -> NftBackend {
    let script = get_mock_nft_path().display().to_string();
    let state = state.display().to_string();
    NftBackend::with_program("sh", &[script.as_str(), state.as_str()])
}

fn calls(state: &Path) -> Vec<String> {
    std::fs::read_to_string(state.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

fn batches(state: &Path) -> Vec<Value> {
    std::fs::read_to_string(state.join("batches.json"))
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn full_config() -> TunnelConfig {
    TunnelConfig {
        ipv6_address: Some("fd00:6d:6f7a::2/128".into()),
        server_addresses: vec!["198.51.100.7".into(), "203.0.113.9".into()],
        excluded_prefixes: vec!["192.168.0.0/16".into()],
        excluded_cgroups: vec!["/user.slice/torrent.scope".into()],
        ..TunnelConfig::default()
    }
}

#[test]
fn test_up_and_down_with_mock() {
    let state = tempfile::tempdir().unwrap();
    let mut ks = KillSwitch::new(mock_backend(state.path()));

    ks.up(&TunnelConfig::default()).unwrap();
    assert!(ks.is_up());

    let log = calls(state.path());
    assert_eq!(log[0], "--json list tables");
    assert!(log[1..].iter().all(|c| c == "--json -f -"));

    let sent = batches(state.path());
    assert_eq!(sent.len(), log.len() - 1);
    let rules: usize = sent
        .iter()
        .flat_map(|b| b["nftables"].as_array().unwrap())
        .filter(|c| c.pointer("/add/rule").is_some())
        .count();
    assert_eq!(rules, ks.rule_count());

    // The mock never reports tables, so teardown has nothing to send
    ks.down().unwrap();
    assert!(!ks.is_up());
    assert_eq!(batches(state.path()).len(), sent.len());
}

#[test]
fn test_mock_batches_match_memory_backend() {
    let state = tempfile::tempdir().unwrap();
    let config = full_config();

    let mut nft = KillSwitch::new(mock_backend(state.path()));
    nft.up(&config).unwrap();

    let mut memory = KillSwitch::new(MemoryBackend::new());
    memory.up(&config).unwrap();
    let expected: Vec<Value> = memory
        .engine()
        .backend()
        .commits()
        .iter()
        .map(|ops| render_batch(ops).unwrap())
        .collect();

    assert_eq!(batches(state.path()), expected);
}

#[test]
fn test_stale_table_replaced_by_baseline() {
    let state = tempfile::tempdir().unwrap();
    std::fs::write(
        state.path().join("tables.json"),
        r#"{"nftables":[{"metainfo":{"json_schema_version":1}},{"table":{"family":"ip","name":"tunwall","handle":7}},{"table":{"family":"inet","name":"filter","handle":1}}]}"#,
    )
    .unwrap();

    let mut ks = KillSwitch::new(mock_backend(state.path()));
    ks.up(&TunnelConfig::default()).unwrap();

    // Deleted in the same transaction that recreates the baseline
    let sent = batches(state.path());
    assert_eq!(
        sent[0]["nftables"][0],
        serde_json::json!({ "delete": { "table": { "family": "ip", "name": "tunwall" } } })
    );
    assert_eq!(
        sent[0]["nftables"][1],
        serde_json::json!({ "add": { "table": { "family": "inet", "name": "tunwall" } } })
    );
    // Tables of other tools are left alone
    assert!(
        sent.iter()
            .flat_map(|b| b["nftables"].as_array().unwrap())
            .all(|c| c.pointer("/delete/table/name") != Some(&Value::from("filter")))
    );
}

/// Listed rule whose first statement matches `path` as nft prints it
fn listed_cgroup_rule(chain: &str, handle: u64, path: &str) -> Value {
    serde_json::json!({ "rule": {
        "family": "inet", "table": "tunwall", "chain": chain, "handle": handle,
        "expr": [
            { "match": {
                "op": "==",
                "left": { "socket": { "key": "cgroupv2", "level": 2 } },
                "right": path
            } },
            { "accept": null }
        ]
    } })
}

#[test]
fn test_clear_cgroup_deletes_listed_rules() {
    let state = tempfile::tempdir().unwrap();
    let mut ks = KillSwitch::new(mock_backend(state.path()));
    ks.up(&TunnelConfig::default()).unwrap();
    ks.mark_cgroup_v2("/user.slice/app.scope").unwrap();

    for (chain, handle, other) in [("classify", 4, 5), ("nat", 9, 10)] {
        let listing = serde_json::json!({ "nftables": [
            { "metainfo": { "json_schema_version": 1 } },
            listed_cgroup_rule(chain, handle, "user.slice/app.scope"),
            listed_cgroup_rule(chain, other, "user.slice/other.scope"),
        ] });
        std::fs::write(
            state.path().join(format!("chain-{chain}.json")),
            listing.to_string(),
        )
        .unwrap();
    }

    ks.clear_cgroup_v2("/user.slice/app.scope").unwrap();

    let sent = batches(state.path());
    let deleted: Vec<(&str, u64)> = sent
        .last()
        .unwrap()["nftables"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| {
            let rule = c.pointer("/delete/rule")?;
            Some((rule["chain"].as_str()?, rule["handle"].as_u64()?))
        })
        .collect();
    assert_eq!(deleted, vec![("classify", 4), ("nat", 9)]);
}

#[test]
fn test_nft_failure_reported() {
    let state = tempfile::tempdir().unwrap();
    std::fs::write(state.path().join("fail"), PERMISSION_DENIED).unwrap();

    let mut ks = KillSwitch::new(mock_backend(state.path()));
    let err = ks.up(&TunnelConfig::default()).unwrap_err();
    assert!(!ks.is_up());
    assert_eq!(err.code(), -5);

    let Error::Nftables {
        stderr: Some(stderr),
        exit_code,
        ..
    } = &err
    else {
        panic!("expected an nftables error, got {err:?}");
    };
    assert_eq!(*exit_code, Some(1));
    let hint = NftablesErrorPattern::match_error(stderr);
    assert!(hint.user_message.contains("permissions"));
    assert!(!hint.suggestions.is_empty());
}

#[test]
fn test_down_failure_keeps_state() {
    let state = tempfile::tempdir().unwrap();
    let mut ks = KillSwitch::new(mock_backend(state.path()));
    ks.up(&TunnelConfig::default()).unwrap();

    std::fs::write(state.path().join("fail"), PERMISSION_DENIED).unwrap();
    assert!(ks.down().is_err());
    assert!(ks.is_up());

    std::fs::remove_file(state.path().join("fail")).unwrap();
    ks.down().unwrap();
    assert!(!ks.is_up());
}

#[test]
fn test_verify_with_mock() {
    let state = tempfile::tempdir().unwrap();
    let mut memory = KillSwitch::new(MemoryBackend::new());
    memory.up(&full_config()).unwrap();
    let ops: Vec<_> = memory
        .engine()
        .backend()
        .commits()
        .iter()
        .flatten()
        .cloned()
        .collect();
    let batch = render_batch(&ops).unwrap();

    let nft = mock_backend(state.path());
    let result = verify_batch(&nft, &batch).unwrap();
    assert!(result.success, "errors: {:?}", result.errors);
    assert!(calls(state.path())[0].contains("--check"));

    std::fs::write(state.path().join("fail"), PERMISSION_DENIED).unwrap();
    let result = verify_batch(&nft, &batch).unwrap();
    assert!(!result.success);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.contains("Operation not permitted"))
    );
}

#[test]
fn test_fingerprint_stable_across_runs() {
    let render = || {
        let mut ks = KillSwitch::new(MemoryBackend::new());
        ks.up(&full_config()).unwrap();
        let ops: Vec<_> = ks
            .engine()
            .backend()
            .commits()
            .iter()
            .flatten()
            .cloned()
            .collect();
        render_batch(&ops).unwrap()
    };
    let first = fingerprint(&render());
    assert_eq!(first, fingerprint(&render()));
    assert_eq!(first.len(), 64);
}

#[test]
fn test_config_to_kernel_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    save_config(&full_config(), &path).unwrap();
    let config = load_config(&path).unwrap();

    let mut ks = KillSwitch::new(MemoryBackend::new());
    ks.up(&config).unwrap();

    let backend = ks.engine().backend();
    let servers = backend.set_elements(&table_ref(), "servers").unwrap();
    assert!(servers.contains(&Ipv4Addr::new(198, 51, 100, 7)));
    assert!(servers.contains(&Ipv4Addr::new(203, 0, 113, 9)));
    // restrict 5 + prefix 1 + dhcp 2 + dns 2 + ndp 4
    assert_eq!(
        backend.chain_rules(&table_ref(), CHAIN_OUTPUT).unwrap().len(),
        14
    );
}

#[test]
fn test_split_tunnel_end_to_end() {
    let mut ks = KillSwitch::new(MemoryBackend::new());
    ks.up(&full_config()).unwrap();
    let engine = ks.engine();
    let table = engine.handles().unwrap().table;
    let lan = Ipv4Addr::new(192, 168, 1, 10);
    let remote = Ipv4Addr::new(93, 184, 216, 34);

    let mut torrent = Packet::tcp_v4(lan, 51413, remote, 443)
        .outbound("eth0")
        .with_cgroup_path("/user.slice/torrent.scope/peer");
    assert_eq!(
        evaluate_hook(engine.ruleset(), table, Hook::Output, &mut torrent).unwrap(),
        Decision::Accept
    );
    assert_eq!(
        evaluate_hook(engine.ruleset(), table, Hook::Postrouting, &mut torrent).unwrap(),
        Decision::Masquerade
    );

    let mut browser = Packet::tcp_v4(lan, 40000, remote, 443)
        .outbound("eth0")
        .with_cgroup_path("/user.slice/browser.scope");
    assert_eq!(
        evaluate_hook(engine.ruleset(), table, Hook::Output, &mut browser).unwrap(),
        Decision::Drop
    );

    let mut handshake = Packet::udp_v4(lan, 40000, Ipv4Addr::new(203, 0, 113, 9), 51820)
        .outbound("eth0");
    assert_eq!(
        evaluate_hook(engine.ruleset(), table, Hook::Output, &mut handshake).unwrap(),
        Decision::Accept
    );

    let mut tunneled = Packet::tcp_v4(Ipv4Addr::new(10, 64, 0, 2), 40000, remote, 443)
        .outbound("wg0");
    assert_eq!(
        evaluate_hook(engine.ruleset(), table, Hook::Output, &mut tunneled).unwrap(),
        Decision::Accept
    );
}
