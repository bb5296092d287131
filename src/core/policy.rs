//! Policy compiler
//!
//! [`PolicyEngine`] turns kill-switch and split-tunnel intents into rules of
//! the `tunwall` table. Each public operation validates its input, builds
//! rules with [`MatchBuilder`], commits them as one batch and logs a single
//! status line.
//!
//! The engine is either Down (no tables) or Up (baseline created). Every
//! operation except [`PolicyEngine::create_baseline`] and
//! [`PolicyEngine::remove_all`] requires Up.
//!
//! # Example
//!
//! ```
//! use tunwall::core::backend::memory::MemoryBackend;
//! use tunwall::core::policy::PolicyEngine;
//!
//! let mut engine = PolicyEngine::new(MemoryBackend::new());
//! engine.create_baseline().unwrap();
//! engine.apply_fwmark(0xca6c).unwrap();
//! engine.restrict_traffic("wg0").unwrap();
//! engine.mark_inbound("198.51.100.7").unwrap();
//! assert!(engine.is_up());
//!
//! engine.remove_all().unwrap();
//! assert!(!engine.is_up());
//! ```

use super::backend::Backend;
use super::error::{Error, Result};
use super::expr::{Expr, RejectKind};
use super::matches::{
    AddrField, ARPHRD_LOOPBACK, CTMARK_EXCLUDED, CTZONE_EXTERNAL, ETH_P_IP, IPPROTO_ICMPV6,
    IPPROTO_TCP, IPPROTO_UDP, MatchBuilder, NFPROTO_IPV4, NFPROTO_IPV6, RTN_LOCAL, cgroup_match,
};
use super::ruleset::{
    ChainId, ChainSpec, ChainType, Family, Hook, KeyType, Policy, Ruleset, SetId, TableId,
    priority,
};
use super::transaction::{self, ListedRule, TableRef};
use crate::validators;
use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use tracing::{debug, error, info, warn};

pub const TABLE_NAME: &str = "tunwall";

pub const CHAIN_CLASSIFY: &str = "classify";
pub const CHAIN_NAT: &str = "nat";
pub const CHAIN_CONNTRACK: &str = "conntrack";
pub const CHAIN_PREROUTE: &str = "preroute";
pub const CHAIN_INPUT: &str = "input";
pub const CHAIN_OUTPUT: &str = "output";

/// Set of VPN server addresses
pub const SERVER_SET: &str = "servers";

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;
const DNS_PORT: u16 = 53;

const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;
const ICMPV6_NEIGHBOR_SOLICITATION: u8 = 135;
const ICMPV6_NEIGHBOR_ADVERTISEMENT: u8 = 136;
const ICMPV6_REDIRECT: u8 = 137;

/// Chain layout of the baseline table: name, type, hook, priority, policy.
const BASELINE_CHAINS: [(&str, ChainType, Hook, i32, Option<Policy>); 6] = [
    (
        CHAIN_CLASSIFY,
        ChainType::Route,
        Hook::Output,
        priority::RAW,
        None,
    ),
    (
        CHAIN_NAT,
        ChainType::Nat,
        Hook::Postrouting,
        priority::NAT_SOURCE,
        None,
    ),
    (
        CHAIN_CONNTRACK,
        ChainType::Route,
        Hook::Output,
        priority::CONNTRACK + 1,
        None,
    ),
    (
        CHAIN_PREROUTE,
        ChainType::Filter,
        Hook::Prerouting,
        priority::RAW,
        None,
    ),
    (
        CHAIN_INPUT,
        ChainType::Filter,
        Hook::Input,
        priority::FILTER,
        Some(Policy::Drop),
    ),
    (
        CHAIN_OUTPUT,
        ChainType::Filter,
        Hook::Output,
        priority::FILTER,
        Some(Policy::Drop),
    ),
];

/// Model handles of the baseline objects, valid while the engine is Up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handles {
    pub table: TableId,
    pub classify: ChainId,
    pub nat: ChainId,
    pub conntrack: ChainId,
    pub preroute: ChainId,
    pub input: ChainId,
    pub output: ChainId,
    pub servers: SetId,
}

/// Explicit policy context; one per VPN session.
#[derive(Debug)]
pub struct PolicyEngine<B: Backend> {
    backend: B,
    ruleset: Ruleset,
    handles: Option<Handles>,
    fwmark: Option<NonZeroU32>,
}

/// Backend reference of the table this engine owns.
pub fn table_ref() -> TableRef {
    TableRef::new(Family::Inet, TABLE_NAME)
}

fn report(op: &str, detail: &str, result: Result<()>) -> Result<()> {
    match &result {
        Ok(()) if detail.is_empty() => info!("{op}: ok"),
        Ok(()) => info!("{op} {detail}: ok"),
        Err(e) => error!("{op} {detail} failed ({}): {e}", e.code()),
    }
    result
}

fn field<T>(name: &str, checked: std::result::Result<T, String>) -> Result<T> {
    checked.map_err(|message| Error::validation(name, message))
}

impl<B: Backend> PolicyEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            ruleset: Ruleset::new(),
            handles: None,
            fwmark: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// The in-memory model; it may be ahead of the kernel after a failed commit.
    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn handles(&self) -> Option<&Handles> {
        self.handles.as_ref()
    }

    pub fn is_up(&self) -> bool {
        self.handles.is_some()
    }

    pub fn fwmark(&self) -> Option<u32> {
        self.fwmark.map(NonZeroU32::get)
    }

    fn up(&self) -> Result<Handles> {
        self.handles
            .ok_or_else(|| Error::precondition("firewall tables are not set up"))
    }

    fn mark(&self) -> Result<u32> {
        self.fwmark
            .map(NonZeroU32::get)
            .ok_or_else(|| Error::precondition("no firewall mark has been applied"))
    }

    fn commit(&mut self) -> Result<()> {
        transaction::commit(&mut self.ruleset, &mut self.backend).map(|_| ())
    }

    /// Creates the `tunwall` table with its chains and server set.
    ///
    /// Succeeds without change when already Up. `tunwall` tables the backend
    /// still holds from an earlier process are deleted in the same batch. The
    /// model only adopts the new objects once the backend accepted them, so a
    /// failure leaves the engine Down.
    pub fn create_baseline(&mut self) -> Result<()> {
        if self.is_up() {
            info!("create_baseline: already up, nothing to do");
            return Ok(());
        }
        let result = self.build_baseline();
        report("create_baseline", "", result)
    }

    fn build_baseline(&mut self) -> Result<()> {
        let mut staged = Ruleset::new();
        for stale in self.backend.list_tables()? {
            if stale.name == TABLE_NAME {
                warn!("Replacing {stale} left by a previous run");
                staged.drop_table_by_ref(stale);
            }
        }
        let table = staged.new_table(Family::Inet, TABLE_NAME);

        let mut chains = Vec::with_capacity(BASELINE_CHAINS.len());
        for (name, kind, hook, prio, policy) in BASELINE_CHAINS {
            let spec = ChainSpec {
                kind,
                hook,
                priority: prio,
                policy,
            };
            chains.push(staged.new_chain(table, name, spec)?);
        }
        let servers = staged.new_set(table, SERVER_SET, KeyType::Ipv4Addr)?;

        transaction::commit(&mut staged, &mut self.backend)?;

        self.ruleset = staged;
        self.handles = Some(Handles {
            table,
            classify: chains[0],
            nat: chains[1],
            conntrack: chains[2],
            preroute: chains[3],
            input: chains[4],
            output: chains[5],
            servers,
        });
        Ok(())
    }

    /// Deletes every `tunwall` table the backend reports, of any family.
    ///
    /// Succeeds when there is nothing to delete. On failure the engine stays
    /// Up with its model untouched.
    pub fn remove_all(&mut self) -> Result<()> {
        let result = self.teardown();
        report("remove_all", "", result)
    }

    fn teardown(&mut self) -> Result<()> {
        let ours: Vec<TableRef> = self
            .backend
            .list_tables()?
            .into_iter()
            .filter(|t| t.name == TABLE_NAME)
            .collect();

        let mut staged = self.ruleset.clone();
        for table in ours {
            debug!("Deleting table {table}");
            staged.drop_table_by_ref(table);
        }
        transaction::commit(&mut staged, &mut self.backend)?;

        self.ruleset = Ruleset::new();
        self.handles = None;
        self.fwmark = None;
        Ok(())
    }

    /// Tags excluded traffic's conntrack state and marks inbound server replies.
    pub fn apply_fwmark(&mut self, mark: u32) -> Result<()> {
        let result = self.try_apply_fwmark(mark);
        report("apply_fwmark", &format!("{mark:#x}"), result)
    }

    fn try_apply_fwmark(&mut self, mark: u32) -> Result<()> {
        let mark = field("fwmark", validators::validate_fwmark(mark))?;
        let h = self.up()?;
        let m = mark.get();

        self.ruleset.add_rule(
            h.conntrack,
            MatchBuilder::new()
                .mark(m)
                .set_ct_zone(CTZONE_EXTERNAL)
                .set_ct_mark(CTMARK_EXCLUDED)
                .build(),
        )?;
        self.ruleset.add_rule(
            h.preroute,
            MatchBuilder::new()
                .nfproto(NFPROTO_IPV4)
                .l4proto(IPPROTO_UDP)
                .lookup_ipv4(AddrField::Saddr, SERVER_SET)
                .set_mark(m)
                .set_ct_zone(CTZONE_EXTERNAL)
                .build(),
        )?;
        self.commit()?;
        self.fwmark = Some(mark);
        Ok(())
    }

    /// Installs the kill-switch allow-list; everything else hits the drop policy.
    pub fn restrict_traffic(&mut self, ifname: &str) -> Result<()> {
        let result = self.try_restrict_traffic(ifname);
        report("restrict_traffic", ifname, result)
    }

    fn try_restrict_traffic(&mut self, ifname: &str) -> Result<()> {
        let ifname = field("interface", validators::validate_interface(ifname))?;
        let h = self.up()?;
        let mark = self.mark()?;

        let input = [
            MatchBuilder::new().iiftype(ARPHRD_LOOPBACK).accept(),
            MatchBuilder::new().iifname(&ifname).accept(),
            MatchBuilder::new()
                .protocol(ETH_P_IP)
                .l4proto(IPPROTO_UDP)
                .lookup_ipv4(AddrField::Saddr, SERVER_SET)
                .accept(),
            MatchBuilder::new().ct_mark(CTMARK_EXCLUDED).accept(),
            MatchBuilder::new().mark(mark).accept(),
        ];
        let output = [
            MatchBuilder::new().oiftype(ARPHRD_LOOPBACK).accept(),
            MatchBuilder::new().oifname(&ifname).accept(),
            MatchBuilder::new()
                .protocol(ETH_P_IP)
                .l4proto(IPPROTO_UDP)
                .lookup_ipv4(AddrField::Daddr, SERVER_SET)
                .accept(),
            MatchBuilder::new().ct_mark(CTMARK_EXCLUDED).accept(),
            MatchBuilder::new().mark(mark).accept(),
        ];

        for exprs in input {
            self.ruleset.add_rule(h.input, exprs)?;
        }
        for exprs in output {
            self.ruleset.add_rule(h.output, exprs)?;
        }
        self.commit()
    }

    /// Accepts traffic to and from `cidr` in both directions.
    pub fn allow_prefix(&mut self, cidr: &str) -> Result<()> {
        let result = self.try_allow_prefix(cidr);
        report("allow_prefix", cidr, result)
    }

    fn try_allow_prefix(&mut self, cidr: &str) -> Result<()> {
        let net: IpNetwork = field("prefix", validators::parse_prefix(cidr))?;
        let h = self.up()?;
        if let Some(warning) = validators::check_excluded_prefix(net) {
            warn!("{warning}");
        }

        self.ruleset.add_rule(
            h.output,
            MatchBuilder::new().ip_net(&net, AddrField::Daddr).accept(),
        )?;
        self.ruleset.add_rule(
            h.input,
            MatchBuilder::new().ip_net(&net, AddrField::Saddr).accept(),
        )?;
        self.commit()
    }

    /// Adds a server address to the server set.
    pub fn mark_inbound(&mut self, server: &str) -> Result<()> {
        let result = self.update_servers(server, true);
        report("mark_inbound", server, result)
    }

    /// Removes a server address from the server set.
    pub fn clear_inbound(&mut self, server: &str) -> Result<()> {
        let result = self.update_servers(server, false);
        report("clear_inbound", server, result)
    }

    /// Empties the server set.
    pub fn clear_all_inbound(&mut self) -> Result<()> {
        let result = self.try_clear_all_inbound();
        report("clear_all_inbound", "", result)
    }

    fn try_clear_all_inbound(&mut self) -> Result<()> {
        let h = self.up()?;
        self.ruleset.flush_set(h.servers)?;
        self.commit()
    }

    fn update_servers(&mut self, server: &str, add: bool) -> Result<()> {
        let addr: Ipv4Addr = field("server", validators::parse_server_address(server))?;
        let h = self.up()?;
        if add {
            self.ruleset.add_elements(h.servers, &[addr])?;
        } else {
            self.ruleset.delete_elements(h.servers, &[addr])?;
        }
        self.commit()
    }

    /// Drops packets for the tunnel's IPv6 address arriving on any other
    /// interface from a non-local source.
    pub fn isolate_tunnel_address(&mut self, ifname: &str, address: &str) -> Result<()> {
        let result = self.try_isolate(ifname, address);
        report("isolate_tunnel_address", &format!("{ifname} {address}"), result)
    }

    fn try_isolate(&mut self, ifname: &str, address: &str) -> Result<()> {
        let ifname = field("interface", validators::validate_interface(ifname))?;
        let addr = field("address", validators::parse_tunnel_address(address))?;
        let h = self.up()?;

        self.ruleset.add_rule(
            h.preroute,
            MatchBuilder::new()
                .nfproto(NFPROTO_IPV6)
                .iifname_ne(&ifname)
                .fib_saddr_type_ne(RTN_LOCAL)
                .ipv6_addr(AddrField::Daddr, addr)
                .drop(),
        )?;
        self.commit()
    }

    /// Excludes a cgroup v1 `net_cls` class from the tunnel.
    pub fn mark_cgroup_v1(&mut self, classid: u32) -> Result<()> {
        let result = self.try_mark_cgroup_v1(classid);
        report("mark_cgroup_v1", &format!("{classid:#x}"), result)
    }

    fn try_mark_cgroup_v1(&mut self, classid: u32) -> Result<()> {
        let classid = field("classid", validators::validate_classid(classid))?;
        let h = self.up()?;
        let mark = self.mark()?;

        self.ruleset.add_rule(
            h.classify,
            MatchBuilder::new()
                .cgroup_id(classid)
                .oiftype_ne(ARPHRD_LOOPBACK)
                .set_mark(mark)
                .build(),
        )?;
        self.ruleset.add_rule(
            h.nat,
            MatchBuilder::new()
                .cgroup_id(classid)
                .mark(mark)
                .masquerade(),
        )?;
        self.commit()
    }

    /// Excludes a cgroup v2 path from the tunnel.
    pub fn mark_cgroup_v2(&mut self, path: &str) -> Result<()> {
        let result = self.try_mark_cgroup_v2(path);
        report("mark_cgroup_v2", path, result)
    }

    fn try_mark_cgroup_v2(&mut self, path: &str) -> Result<()> {
        let path = field("cgroup", validators::validate_cgroup_path(path))?;
        let h = self.up()?;
        let mark = self.mark()?;

        self.ruleset.add_rule(
            h.classify,
            MatchBuilder::new()
                .cgroup_path(&path)
                .mark(0)
                .oiftype_ne(ARPHRD_LOOPBACK)
                .set_mark(mark)
                .build(),
        )?;
        self.ruleset.add_rule(
            h.nat,
            MatchBuilder::new()
                .cgroup_path(&path)
                .mark(mark)
                .masquerade(),
        )?;
        self.commit()
    }

    /// Deletes every classify and nat rule that leads with the cgroup match
    /// for `path`.
    ///
    /// Both chains are listed from the backend before anything is journaled,
    /// so their handles are current and a failed listing changes nothing.
    pub fn reset_cgroup_v2(&mut self, path: &str) -> Result<()> {
        let result = self.try_reset_cgroup_v2(path);
        report("reset_cgroup_v2", path, result)
    }

    fn try_reset_cgroup_v2(&mut self, path: &str) -> Result<()> {
        let path = field("cgroup", validators::validate_cgroup_path(path))?;
        let h = self.up()?;
        let target = Expr::Match(cgroup_match(&path));
        let table = table_ref();

        let classify = self.backend.list_rules(&table, CHAIN_CLASSIFY)?;
        let nat = self.backend.list_rules(&table, CHAIN_NAT)?;
        let listings = [
            (h.classify, CHAIN_CLASSIFY, classify),
            (h.nat, CHAIN_NAT, nat),
        ];

        if let Err(e) = self.journal_cgroup_deletions(listings, &target, &path) {
            self.ruleset.take_pending();
            return Err(e);
        }
        self.commit()
    }

    fn journal_cgroup_deletions(
        &mut self,
        listings: [(ChainId, &str, Vec<ListedRule>); 2],
        target: &Expr,
        path: &str,
    ) -> Result<()> {
        for (chain, name, listed) in listings {
            let ids = self.ruleset.adopt_rules(chain, listed)?;
            for id in ids {
                let leads_with_target = self
                    .ruleset
                    .rule(id)
                    .is_some_and(|r| r.exprs.first() == Some(target));
                if leads_with_target {
                    debug!("Deleting {name} rule {id:?} for cgroup {path}");
                    self.ruleset.delete_rule(id)?;
                }
            }
        }
        Ok(())
    }

    /// Flushes the classify and nat chains.
    pub fn reset_all_cgroups(&mut self) -> Result<()> {
        let result = self.try_reset_all_cgroups();
        report("reset_all_cgroups", "", result)
    }

    fn try_reset_all_cgroups(&mut self) -> Result<()> {
        let h = self.up()?;
        self.ruleset.flush_chain(h.classify)?;
        self.ruleset.flush_chain(h.nat)?;
        self.commit()
    }

    /// Lets DHCPv4 through in both directions.
    pub fn allow_dhcp(&mut self) -> Result<()> {
        let result = self.try_allow_dhcp();
        report("allow_dhcp", "", result)
    }

    fn try_allow_dhcp(&mut self) -> Result<()> {
        let h = self.up()?;
        let discover = || {
            MatchBuilder::new()
                .l4proto(IPPROTO_UDP)
                .sport(DHCP_CLIENT_PORT)
                .nfproto(NFPROTO_IPV4)
                .ipv4_addr(AddrField::Daddr, Ipv4Addr::BROADCAST)
                .l4proto(IPPROTO_UDP)
                .dport(DHCP_SERVER_PORT)
                .accept()
        };

        self.ruleset.add_rule(h.output, discover())?;
        self.ruleset.add_rule(
            h.output,
            MatchBuilder::new()
                .l4proto(IPPROTO_UDP)
                .sport(DHCP_SERVER_PORT)
                .l4proto(IPPROTO_UDP)
                .dport(DHCP_CLIENT_PORT)
                .accept(),
        )?;
        self.ruleset.add_rule(h.input, discover())?;
        self.ruleset.add_rule(
            h.input,
            MatchBuilder::new()
                .l4proto(IPPROTO_UDP)
                .sport(DHCP_CLIENT_PORT)
                .l4proto(IPPROTO_UDP)
                .dport(DHCP_SERVER_PORT)
                .accept(),
        )?;
        self.commit()
    }

    /// Rejects plain DNS leaving the host outside the tunnel.
    pub fn block_dns(&mut self) -> Result<()> {
        let result = self.try_block_dns();
        report("block_dns", "", result)
    }

    fn try_block_dns(&mut self) -> Result<()> {
        let h = self.up()?;
        self.ruleset.add_rule(
            h.output,
            MatchBuilder::new()
                .l4proto(IPPROTO_UDP)
                .dport(DNS_PORT)
                .reject(RejectKind::IcmpxPortUnreachable),
        )?;
        self.ruleset.add_rule(
            h.output,
            MatchBuilder::new()
                .l4proto(IPPROTO_TCP)
                .dport(DNS_PORT)
                .reject(RejectKind::TcpReset),
        )?;
        self.commit()
    }

    /// Lets IPv6 neighbor discovery through.
    pub fn allow_ndp(&mut self) -> Result<()> {
        let result = self.try_allow_ndp();
        report("allow_ndp", "", result)
    }

    fn try_allow_ndp(&mut self) -> Result<()> {
        let h = self.up()?;
        let net = |s: &str| {
            s.parse::<IpNetwork>()
                .map_err(|e| Error::Internal(format!("bad NDP prefix {s}: {e}")))
        };
        let all_routers = net("ff02::2/128")?;
        let solicited_node = net("ff02::1:ff00:0/104")?;
        let link_local = net("fe80::/10")?;

        let icmp = |dst: &IpNetwork, icmp_type: u8| {
            MatchBuilder::new()
                .ip_net(dst, AddrField::Daddr)
                .l4proto(IPPROTO_ICMPV6)
                .icmpv6(icmp_type, 0)
                .accept()
        };

        let output = [
            icmp(&all_routers, ICMPV6_ROUTER_SOLICITATION),
            icmp(&solicited_node, ICMPV6_NEIGHBOR_SOLICITATION),
            icmp(&link_local, ICMPV6_NEIGHBOR_SOLICITATION),
            icmp(&link_local, ICMPV6_NEIGHBOR_ADVERTISEMENT),
        ];
        let input = [
            icmp(&link_local, ICMPV6_ROUTER_ADVERTISEMENT),
            icmp(&link_local, ICMPV6_NEIGHBOR_SOLICITATION),
            icmp(&link_local, ICMPV6_NEIGHBOR_ADVERTISEMENT),
            icmp(&link_local, ICMPV6_REDIRECT),
        ];
        for exprs in output {
            self.ruleset.add_rule(h.output, exprs)?;
        }
        for exprs in input {
            self.ruleset.add_rule(h.input, exprs)?;
        }
        self.commit()
    }
}
