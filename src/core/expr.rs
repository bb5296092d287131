//! Register-level rule expressions
//!
//! An [`Expr`] is one step of what nf_tables executes for a rule: loads into
//! the (single, implicit) register, comparisons against it, statements that
//! write it somewhere, and a terminal verdict. Rules are plain `Vec<Expr>`;
//! builders live in [`super::matches`].

/// Metadata keys loaded with `meta` / written with `meta set`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum MetaKey {
    #[strum(serialize = "iifname")]
    Iifname,
    #[strum(serialize = "oifname")]
    Oifname,
    #[strum(serialize = "iiftype")]
    Iiftype,
    #[strum(serialize = "oiftype")]
    Oiftype,
    #[strum(serialize = "nfproto")]
    Nfproto,
    #[strum(serialize = "l4proto")]
    L4proto,
    #[strum(serialize = "protocol")]
    Protocol,
    #[strum(serialize = "mark")]
    Mark,
    #[strum(serialize = "cgroup")]
    Cgroup,
}

impl MetaKey {
    /// Width in bytes of the value the kernel loads for this key.
    pub const fn width(self) -> usize {
        match self {
            Self::Iifname | Self::Oifname => 16,
            Self::Iiftype | Self::Oiftype | Self::Protocol => 2,
            Self::Nfproto | Self::L4proto => 1,
            Self::Mark | Self::Cgroup => 4,
        }
    }
}

/// Header a payload load is relative to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum PayloadBase {
    /// Network header (IPv4 / IPv6)
    #[strum(serialize = "nh")]
    Network,
    /// Transport header (UDP / TCP / ICMPv6)
    #[strum(serialize = "th")]
    Transport,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum CmpOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Neq,
}

/// Conntrack keys read with `ct` / written with `ct set`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum CtKey {
    #[strum(serialize = "mark")]
    Mark,
    #[strum(serialize = "zone")]
    Zone,
}

impl CtKey {
    pub const fn width(self) -> usize {
        match self {
            Self::Mark => 4,
            Self::Zone => 2,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum FibFlag {
    #[strum(serialize = "saddr")]
    Saddr,
    #[strum(serialize = "daddr")]
    Daddr,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum FibResult {
    #[strum(serialize = "oif")]
    Oif,
    /// Route address type (`RTN_*`)
    #[strum(serialize = "type")]
    AddrType,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum RejectKind {
    #[strum(serialize = "icmpx port-unreachable")]
    IcmpxPortUnreachable,
    #[strum(serialize = "tcp reset")]
    TcpReset,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Verdict {
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// An x_tables match carried inside an nf_tables rule.
///
/// `info` is the raw kernel argument block; two matches are the same match
/// exactly when name, revision and block bytes are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XtMatch {
    pub name: String,
    pub rev: u32,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Load a metadata key into the register
    Meta { key: MetaKey },
    /// Write the register into a metadata key
    MetaSet { key: MetaKey },
    /// Load `len` bytes at `offset` of a packet header
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    /// `reg = (reg & mask) ^ xor`
    Bitwise { mask: Vec<u8>, xor: Vec<u8> },
    /// Compare the register; a failed comparison ends rule evaluation
    Cmp { op: CmpOp, data: Vec<u8> },
    /// Register must be an element of the named set
    Lookup { set: String },
    /// Load constant data into the register
    Immediate { data: Vec<u8> },
    /// Load a conntrack key into the register
    Ct { key: CtKey },
    /// Write the register into a conntrack key
    CtSet { key: CtKey },
    /// Route lookup
    Fib { flag: FibFlag, result: FibResult },
    Match(XtMatch),
    Masquerade,
    Reject(RejectKind),
    Verdict(Verdict),
    /// Listed expression that this crate does not model
    Opaque(serde_json::Value),
}

impl Expr {
    /// True for expressions that end rule evaluation with a decision.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Masquerade | Self::Reject(_) | Self::Verdict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_keyword_round_trip() {
        assert_eq!(MetaKey::Oiftype.to_string(), "oiftype");
        assert_eq!(MetaKey::from_str("l4proto").ok(), Some(MetaKey::L4proto));
        assert_eq!(PayloadBase::Transport.as_ref(), "th");
        assert_eq!(CmpOp::Neq.to_string(), "!=");
        assert_eq!(FibResult::AddrType.to_string(), "type");
    }

    #[test]
    fn test_terminal_expressions() {
        assert!(Expr::Masquerade.is_terminal());
        assert!(Expr::Verdict(Verdict::Drop).is_terminal());
        assert!(Expr::Reject(RejectKind::TcpReset).is_terminal());
        assert!(!Expr::CtSet { key: CtKey::Mark }.is_terminal());
    }
}
