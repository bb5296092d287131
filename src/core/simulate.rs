//! Rule evaluation against synthetic packets
//!
//! Walks the expressions of a modeled chain with the kernel's register
//! semantics: loads fill the register, a failed compare or lookup ends the
//! rule, statements write the register back into the packet, and the first
//! terminal expression decides. A chain that runs out of rules falls back to
//! its policy.
//!
//! Only the fields tunwall's own rules inspect are modeled. A load of a field
//! the packet does not have (an input interface on an outgoing packet, bytes
//! past the end of a header) breaks the rule the way the kernel does.

use super::error::{Error, Result};
use super::expr::{
    CmpOp, CtKey, Expr, FibFlag, FibResult, MetaKey, PayloadBase, RejectKind, Verdict, XtMatch,
};
use super::matches::{
    ARPHRD_LOOPBACK, ETH_P_IP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP, NFPROTO_IPV4,
    NFPROTO_IPV6, decode_cgroup_match, ifname, normalize_cgroup_path,
};
use super::ruleset::{ChainId, Hook, Policy, RuleId, Ruleset, TableId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const ETH_P_IPV6: u16 = 0x86dd;
const ARPHRD_ETHER: u16 = 1;
const ARPHRD_NONE: u16 = 0xfffe;

/// RTN_UNICAST, the fib type of an ordinary remote address
const RTN_UNICAST: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub iifname: Option<String>,
    pub iiftype: Option<u16>,
    pub oifname: Option<String>,
    pub oiftype: Option<u16>,
    pub nfproto: u8,
    pub l4proto: u8,
    /// Ethertype
    pub protocol: u16,
    pub mark: u32,
    pub ct_mark: u32,
    pub ct_zone: u16,
    /// cgroup v1 `net_cls` classid of the sending socket
    pub cgroup: u32,
    /// cgroup v2 path of the sending socket
    pub cgroup_path: Option<String>,
    pub network: Vec<u8>,
    pub transport: Vec<u8>,
    pub fib_saddr_type: u32,
    pub fib_daddr_type: u32,
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Vec<u8> {
    let mut h = vec![0u8; 20];
    h[0] = 0x45;
    h[8] = 64;
    h[9] = proto;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    h
}

fn ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, next: u8) -> Vec<u8> {
    let mut h = vec![0u8; 40];
    h[0] = 0x60;
    h[6] = next;
    h[7] = 255;
    h[8..24].copy_from_slice(&src.octets());
    h[24..40].copy_from_slice(&dst.octets());
    h
}

fn ports(sport: u16, dport: u16, len: usize) -> Vec<u8> {
    let mut t = vec![0u8; len];
    t[0..2].copy_from_slice(&sport.to_be_bytes());
    t[2..4].copy_from_slice(&dport.to_be_bytes());
    t
}

impl Packet {
    fn new(nfproto: u8, l4proto: u8, network: Vec<u8>, transport: Vec<u8>) -> Self {
        Self {
            iifname: None,
            iiftype: None,
            oifname: None,
            oiftype: None,
            nfproto,
            l4proto,
            protocol: if nfproto == NFPROTO_IPV4 {
                ETH_P_IP
            } else {
                ETH_P_IPV6
            },
            mark: 0,
            ct_mark: 0,
            ct_zone: 0,
            cgroup: 0,
            cgroup_path: None,
            network,
            transport,
            fib_saddr_type: RTN_UNICAST,
            fib_daddr_type: RTN_UNICAST,
        }
    }

    pub fn udp_v4(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Self {
        Self::new(
            NFPROTO_IPV4,
            IPPROTO_UDP,
            ipv4_header(src, dst, IPPROTO_UDP),
            ports(sport, dport, 8),
        )
    }

    pub fn tcp_v4(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Self {
        Self::new(
            NFPROTO_IPV4,
            IPPROTO_TCP,
            ipv4_header(src, dst, IPPROTO_TCP),
            ports(sport, dport, 20),
        )
    }

    pub fn udp_v6(src: Ipv6Addr, sport: u16, dst: Ipv6Addr, dport: u16) -> Self {
        Self::new(
            NFPROTO_IPV6,
            IPPROTO_UDP,
            ipv6_header(src, dst, IPPROTO_UDP),
            ports(sport, dport, 8),
        )
    }

    pub fn icmpv6(src: Ipv6Addr, dst: Ipv6Addr, icmp_type: u8, code: u8) -> Self {
        let mut t = vec![0u8; 8];
        t[0] = icmp_type;
        t[1] = code;
        Self::new(
            NFPROTO_IPV6,
            IPPROTO_ICMPV6,
            ipv6_header(src, dst, IPPROTO_ICMPV6),
            t,
        )
    }

    /// Leaving through `name` (an ethernet-like device).
    #[must_use]
    pub fn outbound(mut self, name: &str) -> Self {
        self.oifname = Some(name.to_string());
        self.oiftype = Some(device_type(name));
        self
    }

    /// Arriving on `name`.
    #[must_use]
    pub fn inbound(mut self, name: &str) -> Self {
        self.iifname = Some(name.to_string());
        self.iiftype = Some(device_type(name));
        self
    }

    #[must_use]
    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    #[must_use]
    pub fn with_ct_mark(mut self, mark: u32) -> Self {
        self.ct_mark = mark;
        self
    }

    #[must_use]
    pub fn with_classid(mut self, classid: u32) -> Self {
        self.cgroup = classid;
        self
    }

    #[must_use]
    pub fn with_cgroup_path(mut self, path: &str) -> Self {
        self.cgroup_path = Some(path.to_string());
        self
    }

    #[must_use]
    pub fn with_fib_saddr_type(mut self, rtn: u32) -> Self {
        self.fib_saddr_type = rtn;
        self
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.address(8, 12)
    }

    pub fn destination(&self) -> Option<IpAddr> {
        self.address(24, 16)
    }

    fn address(&self, v6_offset: usize, v4_offset: usize) -> Option<IpAddr> {
        match self.nfproto {
            NFPROTO_IPV4 => {
                let b: [u8; 4] = self.network.get(v4_offset..v4_offset + 4)?.try_into().ok()?;
                Some(IpAddr::from(b))
            }
            NFPROTO_IPV6 => {
                let b: [u8; 16] = self
                    .network
                    .get(v6_offset..v6_offset + 16)?
                    .try_into()
                    .ok()?;
                Some(IpAddr::from(b))
            }
            _ => None,
        }
    }
}

fn device_type(name: &str) -> u16 {
    if name == "lo" {
        ARPHRD_LOOPBACK
    } else if name.starts_with("wg") || name.starts_with("tun") {
        ARPHRD_NONE
    } else {
        ARPHRD_ETHER
    }
}

/// Outcome of running a packet through one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Drop,
    Reject(RejectKind),
    /// Accepted with source NAT to the egress address
    Masquerade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// Rule that decided, `None` when the chain policy did
    pub matched: Option<RuleId>,
}

enum Step {
    Next,
    Break,
    Decide(Decision),
}

fn native_u32(data: &[u8]) -> Option<u32> {
    Some(u32::from_ne_bytes(data.get(..4)?.try_into().ok()?))
}

fn native_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_ne_bytes(data.get(..2)?.try_into().ok()?))
}

/// cgroup v2 matches the named cgroup and everything below it.
fn cgroup_matches(m: &XtMatch, packet: &Packet) -> bool {
    if m.name != "cgroup" || m.rev != 2 {
        return false;
    }
    let (Some(target), Some(path)) = (decode_cgroup_match(&m.info), &packet.cgroup_path) else {
        return false;
    };
    let path = normalize_cgroup_path(path);
    let target = target.trim_end_matches('/');
    path == target || path.starts_with(&format!("{target}/"))
}

struct Machine<'a> {
    ruleset: &'a Ruleset,
    table: TableId,
    reg: Option<Vec<u8>>,
}

impl Machine<'_> {
    fn load_meta(key: MetaKey, p: &Packet) -> Option<Vec<u8>> {
        Some(match key {
            MetaKey::Iifname => ifname(p.iifname.as_deref()?),
            MetaKey::Oifname => ifname(p.oifname.as_deref()?),
            MetaKey::Iiftype => p.iiftype?.to_ne_bytes().to_vec(),
            MetaKey::Oiftype => p.oiftype?.to_ne_bytes().to_vec(),
            MetaKey::Nfproto => vec![p.nfproto],
            MetaKey::L4proto => vec![p.l4proto],
            MetaKey::Protocol => p.protocol.to_be_bytes().to_vec(),
            MetaKey::Mark => p.mark.to_ne_bytes().to_vec(),
            MetaKey::Cgroup => p.cgroup.to_ne_bytes().to_vec(),
        })
    }

    fn step(&mut self, expr: &Expr, p: &mut Packet) -> Step {
        match expr {
            Expr::Meta { key } => {
                self.reg = Self::load_meta(*key, p);
                if self.reg.is_none() {
                    return Step::Break;
                }
            }
            Expr::Payload { base, offset, len } => {
                let header = match base {
                    PayloadBase::Network => &p.network,
                    PayloadBase::Transport => &p.transport,
                };
                let start = *offset as usize;
                let Some(bytes) = header.get(start..start + *len as usize) else {
                    return Step::Break;
                };
                self.reg = Some(bytes.to_vec());
            }
            Expr::Bitwise { mask, xor } => {
                let Some(reg) = self.reg.as_mut() else {
                    return Step::Break;
                };
                for (i, b) in reg.iter_mut().enumerate() {
                    *b = (*b & mask.get(i).copied().unwrap_or(0)) ^ xor.get(i).copied().unwrap_or(0);
                }
            }
            Expr::Cmp { op, data } => {
                let equal = self.reg.as_deref() == Some(data.as_slice());
                let hit = match op {
                    CmpOp::Eq => equal,
                    CmpOp::Neq => self.reg.is_some() && !equal,
                };
                if !hit {
                    return Step::Break;
                }
            }
            Expr::Lookup { set } => {
                let member = self
                    .reg
                    .as_deref()
                    .and_then(|r| <[u8; 4]>::try_from(r).ok())
                    .map(Ipv4Addr::from)
                    .zip(self.ruleset.set_by_name(self.table, set))
                    .and_then(|(addr, id)| self.ruleset.set(id).map(|s| s.elements.contains(&addr)))
                    .unwrap_or(false);
                if !member {
                    return Step::Break;
                }
            }
            Expr::Immediate { data } => self.reg = Some(data.clone()),
            Expr::Ct { key } => {
                self.reg = Some(match key {
                    CtKey::Mark => p.ct_mark.to_ne_bytes().to_vec(),
                    CtKey::Zone => p.ct_zone.to_ne_bytes().to_vec(),
                });
            }
            Expr::CtSet { key } => {
                let reg = self.reg.as_deref().unwrap_or_default();
                match key {
                    CtKey::Mark => p.ct_mark = native_u32(reg).unwrap_or(p.ct_mark),
                    CtKey::Zone => p.ct_zone = native_u16(reg).unwrap_or(p.ct_zone),
                }
            }
            Expr::MetaSet { key } => {
                if *key == MetaKey::Mark
                    && let Some(mark) = self.reg.as_deref().and_then(native_u32)
                {
                    p.mark = mark;
                }
            }
            Expr::Fib { flag, result } => {
                self.reg = match result {
                    FibResult::AddrType => Some(
                        match flag {
                            FibFlag::Saddr => p.fib_saddr_type,
                            FibFlag::Daddr => p.fib_daddr_type,
                        }
                        .to_ne_bytes()
                        .to_vec(),
                    ),
                    FibResult::Oif => None,
                };
                if self.reg.is_none() {
                    return Step::Break;
                }
            }
            Expr::Match(m) => {
                if !cgroup_matches(m, p) {
                    return Step::Break;
                }
            }
            Expr::Masquerade => return Step::Decide(Decision::Masquerade),
            Expr::Reject(kind) => return Step::Decide(Decision::Reject(*kind)),
            Expr::Verdict(Verdict::Accept) => return Step::Decide(Decision::Accept),
            Expr::Verdict(Verdict::Drop) => return Step::Decide(Decision::Drop),
            Expr::Opaque(_) => return Step::Break,
        }
        Step::Next
    }
}

/// Runs `packet` through `chain`; statements of matching rules update it.
///
/// # Errors
///
/// Returns `Error::Internal` if `chain` is not part of `ruleset`.
pub fn evaluate(ruleset: &Ruleset, chain: ChainId, packet: &mut Packet) -> Result<Evaluation> {
    let c = ruleset
        .chain(chain)
        .ok_or_else(|| Error::Internal("stale chain handle".to_string()))?;

    for rule in ruleset.list_rules(chain)? {
        let mut machine = Machine {
            ruleset,
            table: c.table,
            reg: None,
        };
        for expr in &rule.exprs {
            match machine.step(expr, packet) {
                Step::Next => {}
                Step::Break => break,
                Step::Decide(decision) => {
                    return Ok(Evaluation {
                        decision,
                        matched: Some(rule.id),
                    });
                }
            }
        }
    }

    let decision = match c.spec.policy {
        Some(Policy::Drop) => Decision::Drop,
        Some(Policy::Accept) | None => Decision::Accept,
    };
    Ok(Evaluation {
        decision,
        matched: None,
    })
}

/// Runs `packet` through every chain of `table` on `hook`, lowest priority first.
///
/// A drop or reject ends the traversal; an accept moves on to the next chain.
/// The result is `Masquerade` when a chain masqueraded and none dropped.
pub fn evaluate_hook(
    ruleset: &Ruleset,
    table: TableId,
    hook: Hook,
    packet: &mut Packet,
) -> Result<Decision> {
    let t = ruleset
        .table(table)
        .ok_or_else(|| Error::Internal("stale table handle".to_string()))?;
    let mut chains: Vec<(i32, ChainId)> = t
        .chains
        .iter()
        .filter_map(|&id| {
            ruleset
                .chain(id)
                .filter(|c| c.spec.hook == hook)
                .map(|c| (c.spec.priority, id))
        })
        .collect();
    chains.sort_by_key(|&(prio, _)| prio);

    let mut outcome = Decision::Accept;
    for (_, id) in chains {
        match evaluate(ruleset, id, packet)?.decision {
            d @ (Decision::Drop | Decision::Reject(_)) => return Ok(d),
            Decision::Masquerade => outcome = Decision::Masquerade,
            Decision::Accept => {}
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matches::{AddrField, MatchBuilder, RTN_LOCAL, cgroup_match};
    use crate::core::ruleset::{ChainSpec, ChainType, Family, KeyType, priority};

    fn output_chain(rs: &mut Ruleset, policy: Option<Policy>) -> (TableId, ChainId) {
        let t = rs.new_table(Family::Inet, "t");
        let c = rs
            .new_chain(
                t,
                "output",
                ChainSpec {
                    kind: ChainType::Filter,
                    hook: Hook::Output,
                    priority: priority::FILTER,
                    policy,
                },
            )
            .unwrap();
        (t, c)
    }

    fn dns_packet() -> Packet {
        Packet::udp_v4(
            Ipv4Addr::new(192, 168, 1, 10),
            40000,
            Ipv4Addr::new(9, 9, 9, 9),
            53,
        )
        .outbound("eth0")
    }

    #[test]
    fn test_empty_chain_uses_policy() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, Some(Policy::Drop));
        let eval = evaluate(&rs, c, &mut dns_packet()).unwrap();
        assert_eq!(eval.decision, Decision::Drop);
        assert_eq!(eval.matched, None);

        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, None);
        assert_eq!(
            evaluate(&rs, c, &mut dns_packet()).unwrap().decision,
            Decision::Accept
        );
    }

    #[test]
    fn test_first_match_wins() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, Some(Policy::Drop));
        rs.add_rule(c, MatchBuilder::new().l4proto(IPPROTO_TCP).accept())
            .unwrap();
        let dns = rs
            .add_rule(
                c,
                MatchBuilder::new()
                    .l4proto(IPPROTO_UDP)
                    .dport(53)
                    .reject(RejectKind::IcmpxPortUnreachable),
            )
            .unwrap();
        rs.add_rule(c, MatchBuilder::new().accept()).unwrap();

        let eval = evaluate(&rs, c, &mut dns_packet()).unwrap();
        assert_eq!(
            eval.decision,
            Decision::Reject(RejectKind::IcmpxPortUnreachable)
        );
        assert_eq!(eval.matched, Some(dns));
    }

    #[test]
    fn test_missing_interface_breaks_rule() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, Some(Policy::Drop));
        rs.add_rule(c, MatchBuilder::new().iifname("eth0").accept())
            .unwrap();
        // Outgoing packets have no input interface
        assert_eq!(
            evaluate(&rs, c, &mut dns_packet()).unwrap().decision,
            Decision::Drop
        );
    }

    #[test]
    fn test_prefix_match() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, Some(Policy::Drop));
        let net = "9.9.0.0/16".parse().unwrap();
        rs.add_rule(c, MatchBuilder::new().ip_net(&net, AddrField::Daddr).accept())
            .unwrap();

        assert_eq!(
            evaluate(&rs, c, &mut dns_packet()).unwrap().decision,
            Decision::Accept
        );
        let mut other = Packet::udp_v4(
            Ipv4Addr::new(192, 168, 1, 10),
            40000,
            Ipv4Addr::new(9, 10, 0, 1),
            53,
        );
        assert_eq!(
            evaluate(&rs, c, &mut other).unwrap().decision,
            Decision::Drop
        );
    }

    #[test]
    fn test_set_lookup_follows_elements() {
        let mut rs = Ruleset::new();
        let (t, c) = output_chain(&mut rs, Some(Policy::Drop));
        let s = rs.new_set(t, "servers", KeyType::Ipv4Addr).unwrap();
        rs.add_rule(
            c,
            MatchBuilder::new()
                .lookup_ipv4(AddrField::Daddr, "servers")
                .accept(),
        )
        .unwrap();

        assert_eq!(
            evaluate(&rs, c, &mut dns_packet()).unwrap().decision,
            Decision::Drop
        );
        rs.add_elements(s, &[Ipv4Addr::new(9, 9, 9, 9)]).unwrap();
        assert_eq!(
            evaluate(&rs, c, &mut dns_packet()).unwrap().decision,
            Decision::Accept
        );
    }

    #[test]
    fn test_statements_update_packet() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, None);
        rs.add_rule(
            c,
            MatchBuilder::new()
                .mark(0)
                .set_mark(0xca6c)
                .set_ct_zone(7)
                .set_ct_mark(9)
                .build(),
        )
        .unwrap();

        let mut p = dns_packet();
        assert_eq!(evaluate(&rs, c, &mut p).unwrap().matched, None);
        assert_eq!((p.mark, p.ct_zone, p.ct_mark), (0xca6c, 7, 9));
    }

    #[test]
    fn test_cgroup_path_matches_descendants() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, None);
        rs.add_rule(c, MatchBuilder::new().cgroup_path("/user.slice/app").drop())
            .unwrap();

        let mut child = dns_packet().with_cgroup_path("/user.slice/app/worker");
        assert_eq!(evaluate(&rs, c, &mut child).unwrap().decision, Decision::Drop);
        let mut sibling = dns_packet().with_cgroup_path("/user.slice/application");
        assert_eq!(
            evaluate(&rs, c, &mut sibling).unwrap().decision,
            Decision::Accept
        );
        assert!(!cgroup_matches(&cgroup_match("/a"), &dns_packet()));
    }

    #[test]
    fn test_fib_and_loopback() {
        let mut rs = Ruleset::new();
        let (_, c) = output_chain(&mut rs, None);
        rs.add_rule(c, MatchBuilder::new().fib_saddr_type_ne(RTN_LOCAL).drop())
            .unwrap();
        let mut remote = dns_packet();
        assert_eq!(evaluate(&rs, c, &mut remote).unwrap().decision, Decision::Drop);
        let mut local = dns_packet().with_fib_saddr_type(RTN_LOCAL);
        assert_eq!(evaluate(&rs, c, &mut local).unwrap().decision, Decision::Accept);

        let p = dns_packet().outbound("lo");
        assert_eq!(p.oiftype, Some(ARPHRD_LOOPBACK));
    }

    #[test]
    fn test_packet_addresses() {
        let p = Packet::icmpv6("fe80::1".parse().unwrap(), "ff02::2".parse().unwrap(), 133, 0);
        assert_eq!(p.destination(), Some("ff02::2".parse().unwrap()));
        assert_eq!(p.transport[0], 133);
        assert_eq!(dns_packet().source(), Some("192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn test_evaluate_hook_orders_by_priority() {
        let mut rs = Ruleset::new();
        let (t, filter) = output_chain(&mut rs, Some(Policy::Drop));
        let classify = rs
            .new_chain(
                t,
                "classify",
                ChainSpec {
                    kind: ChainType::Route,
                    hook: Hook::Output,
                    priority: priority::RAW,
                    policy: None,
                },
            )
            .unwrap();
        rs.add_rule(classify, MatchBuilder::new().set_mark(5).build())
            .unwrap();
        rs.add_rule(filter, MatchBuilder::new().mark(5).accept())
            .unwrap();

        // classify runs first even though it was created second
        let mut p = dns_packet();
        assert_eq!(
            evaluate_hook(&rs, t, Hook::Output, &mut p).unwrap(),
            Decision::Accept
        );
        assert_eq!(p.mark, 5);
    }
}
