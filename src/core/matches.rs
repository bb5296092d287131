//! Match expression builders
//!
//! Everything here produces [`Expr`] sequences with the exact byte encodings
//! the kernel compares against: interface names zero padded to `IFNAMSIZ`,
//! marks and cgroup ids in native byte order, ports and ethertypes in network
//! byte order.
//!
//! # Example
//!
//! ```
//! use tunwall::core::matches::{MatchBuilder, IPPROTO_UDP};
//!
//! // udp dport 53 accept
//! let exprs = MatchBuilder::new().l4proto(IPPROTO_UDP).dport(53).accept();
//! assert_eq!(exprs.len(), 5);
//! ```

use super::expr::{
    CmpOp, CtKey, Expr, FibFlag, FibResult, MetaKey, PayloadBase, RejectKind, Verdict, XtMatch,
};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const NFPROTO_IPV4: u8 = 2;
pub const NFPROTO_IPV6: u8 = 10;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const ARPHRD_LOOPBACK: u16 = 772;
pub const ETH_P_IP: u16 = 0x0800;
pub const RTN_LOCAL: u32 = 2;

pub const IFNAMSIZ: usize = 16;

/// Conntrack mark carried by flows excluded from the tunnel
pub const CTMARK_EXCLUDED: u32 = 0x9e4c;

/// Conntrack zone for excluded traffic, keeps its state apart from tunneled flows
pub const CTZONE_EXTERNAL: u16 = 0x9e4c;

/// Size of the path field in `xt_cgroup_info_v2`
pub const CGROUP_PATH_LEN: usize = 512;

/// Total size of the `xt_cgroup_info_v2` argument block
pub const CGROUP_INFO_LEN: usize = 4 + CGROUP_PATH_LEN + 8;

pub const IPV4_SADDR_OFFSET: u32 = 12;
pub const IPV4_DADDR_OFFSET: u32 = 16;
pub const IPV6_SADDR_OFFSET: u32 = 8;
pub const IPV6_DADDR_OFFSET: u32 = 24;

/// Which address of the network header a match inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum AddrField {
    #[strum(serialize = "saddr")]
    Saddr,
    #[strum(serialize = "daddr")]
    Daddr,
}

impl AddrField {
    pub const fn ipv4_offset(self) -> u32 {
        match self {
            Self::Saddr => IPV4_SADDR_OFFSET,
            Self::Daddr => IPV4_DADDR_OFFSET,
        }
    }

    pub const fn ipv6_offset(self) -> u32 {
        match self {
            Self::Saddr => IPV6_SADDR_OFFSET,
            Self::Daddr => IPV6_DADDR_OFFSET,
        }
    }
}

/// Interface name as the kernel stores it: NUL terminated, zero padded to 16 bytes.
///
/// Callers validate length first; anything past 15 bytes is cut so the
/// terminator always fits.
pub fn ifname(name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; IFNAMSIZ];
    let bytes = name.as_bytes();
    let n = bytes.len().min(IFNAMSIZ - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Encodes `xt_cgroup_info_v2` (revision 2) for a cgroup v2 path match.
///
/// Layout: `has_path = 1`, `has_classid = 0`, `invert_path = 0`,
/// `invert_classid = 0`, then the NUL terminated path in a 512 byte field,
/// then 8 bytes of kernel pointer padding. Paths of 512 bytes or more keep
/// their first 511 bytes.
pub fn encode_cgroup_match(path: &str) -> Vec<u8> {
    let mut info = Vec::with_capacity(CGROUP_INFO_LEN);
    info.extend_from_slice(&[1, 0, 0, 0]);

    let bytes = path.as_bytes();
    let n = bytes.len().min(CGROUP_PATH_LEN - 1);
    let mut field = [0u8; CGROUP_PATH_LEN];
    field[..n].copy_from_slice(&bytes[..n]);
    info.extend_from_slice(&field);

    info.extend_from_slice(&[0u8; 8]);
    info
}

/// Canonical cgroup v2 path: relative to the cgroup2 mount, one leading `/`.
///
/// nft lists `socket cgroupv2` values without the leading slash.
pub fn normalize_cgroup_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

pub fn cgroup_match(path: &str) -> XtMatch {
    XtMatch {
        name: "cgroup".to_string(),
        rev: 2,
        info: encode_cgroup_match(path),
    }
}

/// Recovers the path from a cgroup v2 argument block, if it is one.
pub fn decode_cgroup_match(info: &[u8]) -> Option<String> {
    if info.len() != CGROUP_INFO_LEN || info[0] != 1 {
        return None;
    }
    let field = &info[4..4 + CGROUP_PATH_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec()).ok()
}

/// `nfproto == family`, `payload nh @ addr`, `bitwise mask`, `cmp == network`.
///
/// No verdict is appended; callers extend the sequence.
pub fn ip_net_expr(net: &IpNetwork, field: AddrField) -> Vec<Expr> {
    let (family, offset, mask, network) = match net {
        IpNetwork::V4(v4) => (
            NFPROTO_IPV4,
            field.ipv4_offset(),
            v4.mask().octets().to_vec(),
            v4.network().octets().to_vec(),
        ),
        IpNetwork::V6(v6) => (
            NFPROTO_IPV6,
            field.ipv6_offset(),
            v6.mask().octets().to_vec(),
            v6.network().octets().to_vec(),
        ),
    };
    let len = network.len();
    vec![
        Expr::Meta {
            key: MetaKey::Nfproto,
        },
        Expr::Cmp {
            op: CmpOp::Eq,
            data: vec![family],
        },
        Expr::Payload {
            base: PayloadBase::Network,
            offset,
            len: len as u32,
        },
        Expr::Bitwise {
            mask,
            xor: vec![0; len],
        },
        Expr::Cmp {
            op: CmpOp::Eq,
            data: network,
        },
    ]
}

/// Fluent builder for a rule's expression list.
///
/// Match methods append load + compare pairs; statement methods append
/// immediate + set pairs; the terminal methods consume the builder.
#[derive(Debug, Clone, Default)]
pub struct MatchBuilder {
    exprs: Vec<Expr>,
}

impl MatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn meta_cmp(mut self, key: MetaKey, op: CmpOp, data: Vec<u8>) -> Self {
        self.exprs.push(Expr::Meta { key });
        self.exprs.push(Expr::Cmp { op, data });
        self
    }

    pub fn iifname(self, name: &str) -> Self {
        self.meta_cmp(MetaKey::Iifname, CmpOp::Eq, ifname(name))
    }

    pub fn iifname_ne(self, name: &str) -> Self {
        self.meta_cmp(MetaKey::Iifname, CmpOp::Neq, ifname(name))
    }

    pub fn oifname(self, name: &str) -> Self {
        self.meta_cmp(MetaKey::Oifname, CmpOp::Eq, ifname(name))
    }

    pub fn iiftype(self, arphrd: u16) -> Self {
        self.meta_cmp(MetaKey::Iiftype, CmpOp::Eq, arphrd.to_ne_bytes().to_vec())
    }

    pub fn oiftype(self, arphrd: u16) -> Self {
        self.meta_cmp(MetaKey::Oiftype, CmpOp::Eq, arphrd.to_ne_bytes().to_vec())
    }

    pub fn oiftype_ne(self, arphrd: u16) -> Self {
        self.meta_cmp(MetaKey::Oiftype, CmpOp::Neq, arphrd.to_ne_bytes().to_vec())
    }

    pub fn nfproto(self, family: u8) -> Self {
        self.meta_cmp(MetaKey::Nfproto, CmpOp::Eq, vec![family])
    }

    pub fn l4proto(self, proto: u8) -> Self {
        self.meta_cmp(MetaKey::L4proto, CmpOp::Eq, vec![proto])
    }

    /// Link-layer protocol (ethertype), big endian.
    pub fn protocol(self, ethertype: u16) -> Self {
        self.meta_cmp(MetaKey::Protocol, CmpOp::Eq, ethertype.to_be_bytes().to_vec())
    }

    pub fn mark(self, mark: u32) -> Self {
        self.meta_cmp(MetaKey::Mark, CmpOp::Eq, mark.to_ne_bytes().to_vec())
    }

    /// cgroup v1 `net_cls` classid
    pub fn cgroup_id(self, classid: u32) -> Self {
        self.meta_cmp(MetaKey::Cgroup, CmpOp::Eq, classid.to_ne_bytes().to_vec())
    }

    pub fn payload(mut self, base: PayloadBase, offset: u32, data: Vec<u8>) -> Self {
        self.exprs.push(Expr::Payload {
            base,
            offset,
            len: data.len() as u32,
        });
        self.exprs.push(Expr::Cmp {
            op: CmpOp::Eq,
            data,
        });
        self
    }

    pub fn sport(self, port: u16) -> Self {
        self.payload(PayloadBase::Transport, 0, port.to_be_bytes().to_vec())
    }

    pub fn dport(self, port: u16) -> Self {
        self.payload(PayloadBase::Transport, 2, port.to_be_bytes().to_vec())
    }

    /// ICMPv6 type and code (`l4proto` is matched separately)
    pub fn icmpv6(self, icmp_type: u8, code: u8) -> Self {
        self.payload(PayloadBase::Transport, 0, vec![icmp_type])
            .payload(PayloadBase::Transport, 1, vec![code])
    }

    /// Exact IPv4 header address.
    pub fn ipv4_addr(self, field: AddrField, addr: Ipv4Addr) -> Self {
        self.payload(
            PayloadBase::Network,
            field.ipv4_offset(),
            addr.octets().to_vec(),
        )
    }

    /// Exact IPv6 header address.
    pub fn ipv6_addr(self, field: AddrField, addr: Ipv6Addr) -> Self {
        self.payload(
            PayloadBase::Network,
            field.ipv6_offset(),
            addr.octets().to_vec(),
        )
    }

    pub fn ip_net(mut self, net: &IpNetwork, field: AddrField) -> Self {
        self.exprs.extend(ip_net_expr(net, field));
        self
    }

    /// IPv4 header address must be an element of `set`.
    pub fn lookup_ipv4(mut self, field: AddrField, set: &str) -> Self {
        self.exprs.push(Expr::Payload {
            base: PayloadBase::Network,
            offset: field.ipv4_offset(),
            len: 4,
        });
        self.exprs.push(Expr::Lookup {
            set: set.to_string(),
        });
        self
    }

    pub fn ct_mark(mut self, mark: u32) -> Self {
        self.exprs.push(Expr::Ct { key: CtKey::Mark });
        self.exprs.push(Expr::Cmp {
            op: CmpOp::Eq,
            data: mark.to_ne_bytes().to_vec(),
        });
        self
    }

    /// `fib saddr type != rtn`
    pub fn fib_saddr_type_ne(mut self, rtn: u32) -> Self {
        self.exprs.push(Expr::Fib {
            flag: FibFlag::Saddr,
            result: FibResult::AddrType,
        });
        self.exprs.push(Expr::Cmp {
            op: CmpOp::Neq,
            data: rtn.to_ne_bytes().to_vec(),
        });
        self
    }

    /// cgroup v2 socket path
    pub fn cgroup_path(mut self, path: &str) -> Self {
        self.exprs.push(Expr::Match(cgroup_match(path)));
        self
    }

    pub fn set_mark(mut self, mark: u32) -> Self {
        self.exprs.push(Expr::Immediate {
            data: mark.to_ne_bytes().to_vec(),
        });
        self.exprs.push(Expr::MetaSet { key: MetaKey::Mark });
        self
    }

    pub fn set_ct_mark(mut self, mark: u32) -> Self {
        self.exprs.push(Expr::Immediate {
            data: mark.to_ne_bytes().to_vec(),
        });
        self.exprs.push(Expr::CtSet { key: CtKey::Mark });
        self
    }

    pub fn set_ct_zone(mut self, zone: u16) -> Self {
        self.exprs.push(Expr::Immediate {
            data: zone.to_ne_bytes().to_vec(),
        });
        self.exprs.push(Expr::CtSet { key: CtKey::Zone });
        self
    }

    /// Expressions without a terminal action (rule falls through).
    pub fn build(self) -> Vec<Expr> {
        self.exprs
    }

    fn finish(mut self, last: Expr) -> Vec<Expr> {
        self.exprs.push(last);
        self.exprs
    }

    pub fn accept(self) -> Vec<Expr> {
        self.finish(Expr::Verdict(Verdict::Accept))
    }

    pub fn drop(self) -> Vec<Expr> {
        self.finish(Expr::Verdict(Verdict::Drop))
    }

    pub fn masquerade(self) -> Vec<Expr> {
        self.finish(Expr::Masquerade)
    }

    pub fn reject(self, kind: RejectKind) -> Vec<Expr> {
        self.finish(Expr::Reject(kind))
    }
}

/// Parses `addr` or `addr/len`, keeping only the address.
pub fn strip_prefix_len(value: &str) -> Option<IpAddr> {
    let addr = value.split_once('/').map_or(value, |(addr, _)| addr);
    addr.trim().parse().ok()
}
