//! nftables JSON encoding of backend operations and decoding of listings
//!
//! [`render_batch`] turns a batch of [`Op`]s into the document `nft --json -f -`
//! applies as one transaction. Rule expressions are lowered with a small
//! register machine: loads (`meta`, `payload`, `ct`, `fib`, `immediate`) set
//! the register, `bitwise` narrows it, and comparisons, lookups and `set`
//! statements consume it as nft's `match` / `mangle` statements.
//!
//! [`decode_tables`] and [`decode_rules`] read `nft --json list` output back
//! into [`TableRef`]s and [`ListedRule`]s. Statements this crate does not model
//! come back as [`Expr::Opaque`]. nft elides implicit protocol dependencies
//! when listing (`meta l4proto udp th dport 53` lists as `udp dport 53`), so a
//! decoded rule is not always expression-for-expression identical to the one
//! that was added.

use crate::core::error::{Error, Result};
use crate::core::expr::{
    CmpOp, CtKey, Expr, FibFlag, FibResult, MetaKey, PayloadBase, RejectKind, Verdict, XtMatch,
};
use crate::core::matches::{
    ARPHRD_LOOPBACK, ETH_P_IP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP, NFPROTO_IPV4,
    NFPROTO_IPV6, cgroup_match, decode_cgroup_match, normalize_cgroup_path,
};
use crate::core::ruleset::{ChainSpec, Family};
use crate::core::transaction::{ListedRule, Op, TableRef};
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

const ETH_P_IPV6: u16 = 0x86dd;

/// Renders a batch as `{"nftables": [...]}`.
pub fn render_batch(ops: &[Op]) -> Result<Value> {
    let cmds = ops.iter().map(render_op).collect::<Result<Vec<_>>>()?;
    Ok(json!({ "nftables": cmds }))
}

fn table_obj(t: &TableRef) -> Value {
    json!({ "family": t.family.as_ref(), "name": t.name })
}

fn chain_obj(spec: &ChainSpec, table: &TableRef, name: &str) -> Value {
    let mut obj = json!({
        "family": table.family.as_ref(),
        "table": table.name,
        "name": name,
        "type": spec.kind.as_ref(),
        "hook": spec.hook.as_ref(),
        "prio": spec.priority,
    });
    if let Some(policy) = spec.policy {
        obj["policy"] = json!(policy.as_ref());
    }
    obj
}

fn render_op(op: &Op) -> Result<Value> {
    Ok(match op {
        Op::AddTable(t) => json!({ "add": { "table": table_obj(t) } }),
        Op::DeleteTable(t) => json!({ "delete": { "table": table_obj(t) } }),
        Op::AddChain { table, name, spec } => {
            json!({ "add": { "chain": chain_obj(spec, table, name) } })
        }
        Op::AddSet {
            table,
            name,
            key_type,
        } => json!({ "add": { "set": {
            "family": table.family.as_ref(),
            "table": table.name,
            "name": name,
            "type": key_type.as_ref(),
        } } }),
        Op::AddRule {
            table,
            chain,
            exprs,
        } => json!({ "add": { "rule": {
            "family": table.family.as_ref(),
            "table": table.name,
            "chain": chain,
            "expr": lower_exprs(exprs)?,
        } } }),
        Op::DeleteRule {
            table,
            chain,
            handle,
        } => json!({ "delete": { "rule": {
            "family": table.family.as_ref(),
            "table": table.name,
            "chain": chain,
            "handle": handle,
        } } }),
        Op::FlushChain { table, chain } => json!({ "flush": { "chain": {
            "family": table.family.as_ref(),
            "table": table.name,
            "name": chain,
        } } }),
        Op::FlushSet { table, set } => json!({ "flush": { "set": {
            "family": table.family.as_ref(),
            "table": table.name,
            "name": set,
        } } }),
        Op::AddElements {
            table,
            set,
            elements,
        } => json!({ "add": { "element": element_obj(table, set, elements) } }),
        Op::DeleteElements {
            table,
            set,
            elements,
        } => json!({ "delete": { "element": element_obj(table, set, elements) } }),
    })
}

fn element_obj(table: &TableRef, set: &str, elements: &[Ipv4Addr]) -> Value {
    let elem: Vec<String> = elements.iter().map(ToString::to_string).collect();
    json!({
        "family": table.family.as_ref(),
        "table": table.name,
        "name": set,
        "elem": elem,
    })
}

// ─── Lowering ────────────────────────────────────────────────────────────────

/// Register contents while lowering a rule.
#[derive(Debug, Clone)]
enum Reg {
    Empty,
    Meta(MetaKey),
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    Ct(CtKey),
    Fib(FibFlag, FibResult),
    Masked(Box<Reg>, Vec<u8>),
    Immediate(Vec<u8>),
}

/// Well-known header fields nft can name.
fn payload_field(base: PayloadBase, offset: u32, len: u32) -> Option<(&'static str, &'static str)> {
    match (base, offset, len) {
        (PayloadBase::Network, 12, 4) => Some(("ip", "saddr")),
        (PayloadBase::Network, 16, 4) => Some(("ip", "daddr")),
        (PayloadBase::Network, 8, 16) => Some(("ip6", "saddr")),
        (PayloadBase::Network, 24, 16) => Some(("ip6", "daddr")),
        (PayloadBase::Transport, 0, 2) => Some(("th", "sport")),
        (PayloadBase::Transport, 2, 2) => Some(("th", "dport")),
        (PayloadBase::Transport, 0, 1) => Some(("icmpv6", "type")),
        (PayloadBase::Transport, 1, 1) => Some(("icmpv6", "code")),
        _ => None,
    }
}

fn lower_lhs(reg: &Reg) -> Result<Value> {
    Ok(match reg {
        Reg::Meta(key) => json!({ "meta": { "key": key.as_ref() } }),
        Reg::Payload { base, offset, len } => match payload_field(*base, *offset, *len) {
            Some((protocol, field)) => {
                json!({ "payload": { "protocol": protocol, "field": field } })
            }
            None => json!({ "payload": {
                "base": base.as_ref(),
                "offset": offset * 8,
                "len": len * 8,
            } }),
        },
        Reg::Ct(key) => json!({ "ct": { "key": key.as_ref() } }),
        Reg::Fib(flag, result) => {
            json!({ "fib": { "result": result.as_ref(), "flags": [flag.as_ref()] } })
        }
        // Prefix masks fold into the right-hand side
        Reg::Masked(inner, mask) => {
            if prefix_len(mask).is_some() && is_address(inner) {
                lower_lhs(inner)?
            } else {
                json!({ "&": [lower_lhs(inner)?, hex(mask)] })
            }
        }
        Reg::Empty | Reg::Immediate(_) => {
            return Err(Error::Internal(
                "comparison without a loaded register".to_string(),
            ));
        }
    })
}

fn is_address(reg: &Reg) -> bool {
    matches!(reg, Reg::Payload { base, offset, len }
        if matches!(payload_field(*base, *offset, *len), Some((_, "saddr" | "daddr"))))
}

fn prefix_len(mask: &[u8]) -> Option<u32> {
    let mut ones = 0u32;
    let mut seen_zero = false;
    for byte in mask {
        for bit in (0..8).rev() {
            if byte & (1 << bit) != 0 {
                if seen_zero {
                    return None;
                }
                ones += 1;
            } else {
                seen_zero = true;
            }
        }
    }
    Some(ones)
}

fn hex(data: &[u8]) -> String {
    let digits: String = data.iter().map(|b| format!("{b:02x}")).collect();
    format!("0x{digits}")
}

fn ne_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_ne_bytes(data.try_into().ok()?))
}

fn ne_u32(data: &[u8]) -> Option<u32> {
    Some(u32::from_ne_bytes(data.try_into().ok()?))
}

fn be_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(data.try_into().ok()?))
}

fn ip_from_bytes(data: &[u8]) -> Option<IpAddr> {
    match data.len() {
        4 => <[u8; 4]>::try_from(data).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(data).ok().map(IpAddr::from),
        _ => None,
    }
}

fn iface_name(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn fib_type_name(value: u32) -> Option<&'static str> {
    Some(match value {
        0 => "unspec",
        1 => "unicast",
        2 => "local",
        3 => "broadcast",
        4 => "anycast",
        5 => "multicast",
        6 => "blackhole",
        7 => "unreachable",
        8 => "prohibit",
        _ => return None,
    })
}

fn fib_type_value(name: &str) -> Option<u32> {
    (0..=8).find(|&v| fib_type_name(v) == Some(name))
}

/// Renders compared data the way nft prints values for the loaded key.
fn lower_rhs(reg: &Reg, data: &[u8]) -> Value {
    let rendered = match reg {
        Reg::Meta(MetaKey::Iifname | MetaKey::Oifname) => Some(json!(iface_name(data))),
        Reg::Meta(MetaKey::Iiftype | MetaKey::Oiftype) => ne_u16(data).map(|t| match t {
            ARPHRD_LOOPBACK => json!("loopback"),
            other => json!(other),
        }),
        Reg::Meta(MetaKey::Nfproto) => data.first().map(|&p| match p {
            NFPROTO_IPV4 => json!("ipv4"),
            NFPROTO_IPV6 => json!("ipv6"),
            other => json!(other),
        }),
        Reg::Meta(MetaKey::L4proto) => data.first().map(|&p| match p {
            IPPROTO_UDP => json!("udp"),
            IPPROTO_TCP => json!("tcp"),
            IPPROTO_ICMPV6 => json!("ipv6-icmp"),
            other => json!(other),
        }),
        Reg::Meta(MetaKey::Protocol) => be_u16(data).map(|p| match p {
            ETH_P_IP => json!("ip"),
            ETH_P_IPV6 => json!("ip6"),
            other => json!(other),
        }),
        Reg::Meta(MetaKey::Mark | MetaKey::Cgroup) | Reg::Ct(CtKey::Mark) => {
            ne_u32(data).map(|v| json!(v))
        }
        Reg::Ct(CtKey::Zone) => ne_u16(data).map(|v| json!(v)),
        Reg::Fib(_, FibResult::AddrType) => {
            ne_u32(data).map(|v| fib_type_name(v).map_or_else(|| json!(v), |n| json!(n)))
        }
        Reg::Fib(_, FibResult::Oif) => ne_u32(data).map(|v| json!(v)),
        Reg::Payload { base, offset, len } => match payload_field(*base, *offset, *len) {
            Some((_, "saddr" | "daddr")) => ip_from_bytes(data).map(|a| json!(a.to_string())),
            Some((_, "sport" | "dport")) => be_u16(data).map(|p| json!(p)),
            Some(_) => data.first().map(|&b| json!(b)),
            None => None,
        },
        Reg::Masked(inner, mask) => match (prefix_len(mask), is_address(inner)) {
            (Some(len), true) => ip_from_bytes(data)
                .map(|a| json!({ "prefix": { "addr": a.to_string(), "len": len } })),
            _ => None,
        },
        Reg::Empty | Reg::Immediate(_) => None,
    };
    rendered.unwrap_or_else(|| json!(hex(data)))
}

fn lower_value(key_width: usize, data: &[u8]) -> Value {
    match key_width {
        2 => ne_u16(data).map_or_else(|| json!(hex(data)), |v| json!(v)),
        4 => ne_u32(data).map_or_else(|| json!(hex(data)), |v| json!(v)),
        _ => json!(hex(data)),
    }
}

/// Cgroup v2 path matches become `socket cgroupv2 level N "path"`.
fn lower_xt(m: &XtMatch) -> Value {
    if m.name == "cgroup"
        && m.rev == 2
        && let Some(path) = decode_cgroup_match(&m.info)
    {
        let level = path.split('/').filter(|c| !c.is_empty()).count();
        return json!({ "match": {
            "op": "==",
            "left": { "socket": { "key": "cgroupv2", "level": level } },
            "right": path,
        } });
    }
    json!({ "xt": { "type": "match", "name": m.name } })
}

/// Lowers a rule's register-level expressions into nft JSON statements.
pub fn lower_exprs(exprs: &[Expr]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut reg = Reg::Empty;

    for expr in exprs {
        match expr {
            Expr::Meta { key } => reg = Reg::Meta(*key),
            Expr::Payload { base, offset, len } => {
                reg = Reg::Payload {
                    base: *base,
                    offset: *offset,
                    len: *len,
                };
            }
            Expr::Ct { key } => reg = Reg::Ct(*key),
            Expr::Fib { flag, result } => reg = Reg::Fib(*flag, *result),
            Expr::Immediate { data } => reg = Reg::Immediate(data.clone()),
            Expr::Bitwise { mask, xor } => {
                if xor.iter().any(|&b| b != 0) {
                    return Err(Error::Internal(
                        "bitwise xor is not supported in JSON rules".to_string(),
                    ));
                }
                reg = Reg::Masked(Box::new(reg), mask.clone());
            }
            Expr::Cmp { op, data } => {
                out.push(json!({ "match": {
                    "op": op.as_ref(),
                    "left": lower_lhs(&reg)?,
                    "right": lower_rhs(&reg, data),
                } }));
            }
            Expr::Lookup { set } => {
                out.push(json!({ "match": {
                    "op": "==",
                    "left": lower_lhs(&reg)?,
                    "right": format!("@{set}"),
                } }));
            }
            Expr::MetaSet { key } => {
                let Reg::Immediate(data) = &reg else {
                    return Err(Error::Internal("meta set without a value".to_string()));
                };
                out.push(json!({ "mangle": {
                    "key": { "meta": { "key": key.as_ref() } },
                    "value": lower_value(key.width(), data),
                } }));
            }
            Expr::CtSet { key } => {
                let Reg::Immediate(data) = &reg else {
                    return Err(Error::Internal("ct set without a value".to_string()));
                };
                out.push(json!({ "mangle": {
                    "key": { "ct": { "key": key.as_ref() } },
                    "value": lower_value(key.width(), data),
                } }));
            }
            Expr::Match(m) => out.push(lower_xt(m)),
            Expr::Masquerade => out.push(json!({ "masquerade": null })),
            Expr::Reject(RejectKind::IcmpxPortUnreachable) => {
                out.push(json!({ "reject": { "type": "icmpx", "expr": "port-unreachable" } }));
            }
            Expr::Reject(RejectKind::TcpReset) => {
                out.push(json!({ "reject": { "type": "tcp reset" } }));
            }
            Expr::Verdict(Verdict::Accept) => out.push(json!({ "accept": null })),
            Expr::Verdict(Verdict::Drop) => out.push(json!({ "drop": null })),
            Expr::Opaque(v) => out.push(v.clone()),
        }
    }
    Ok(out)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn entries(listing: &Value) -> Result<&Vec<Value>> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Internal("nft listing is missing the nftables array".to_string()))
}

/// Tables named in `nft --json list tables` output.
pub fn decode_tables(listing: &Value) -> Result<Vec<TableRef>> {
    let mut tables = Vec::new();
    for entry in entries(listing)? {
        let Some(table) = entry.get("table") else {
            continue;
        };
        let family = table.get("family").and_then(Value::as_str);
        let name = table.get("name").and_then(Value::as_str);
        // Families tunwall never creates (arp, bridge, netdev) are skipped
        if let (Some(family), Some(name)) = (family, name)
            && let Ok(family) = Family::from_str(family)
        {
            tables.push(TableRef::new(family, name));
        }
    }
    Ok(tables)
}

/// Rules (with handles) in `nft --json --handle list chain` output, in order.
pub fn decode_rules(listing: &Value) -> Result<Vec<ListedRule>> {
    let mut rules = Vec::new();
    for entry in entries(listing)? {
        let Some(rule) = entry.get("rule") else {
            continue;
        };
        let handle = rule
            .get("handle")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Internal("listed rule has no handle".to_string()))?;
        let stmts = rule
            .get("expr")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut exprs = Vec::new();
        for stmt in stmts {
            decode_stmt(stmt, &mut exprs);
        }
        rules.push(ListedRule { handle, exprs });
    }
    Ok(rules)
}

fn decode_stmt(stmt: &Value, out: &mut Vec<Expr>) {
    let decoded = if let Some(m) = stmt.get("match") {
        decode_match(m)
    } else if let Some(m) = stmt.get("mangle") {
        decode_mangle(m)
    } else if stmt.get("accept").is_some() {
        Some(vec![Expr::Verdict(Verdict::Accept)])
    } else if stmt.get("drop").is_some() {
        Some(vec![Expr::Verdict(Verdict::Drop)])
    } else if stmt.get("masquerade").is_some() {
        Some(vec![Expr::Masquerade])
    } else if let Some(r) = stmt.get("reject") {
        match r.get("type").and_then(Value::as_str) {
            Some("icmpx") => Some(vec![Expr::Reject(RejectKind::IcmpxPortUnreachable)]),
            Some("tcp reset") => Some(vec![Expr::Reject(RejectKind::TcpReset)]),
            _ => None,
        }
    } else {
        None
    };
    match decoded {
        Some(exprs) => out.extend(exprs),
        None => out.push(Expr::Opaque(stmt.clone())),
    }
}

fn decode_load(left: &Value) -> Option<Reg> {
    if let Some(meta) = left.get("meta") {
        let key = MetaKey::from_str(meta.get("key")?.as_str()?).ok()?;
        return Some(Reg::Meta(key));
    }
    if let Some(ct) = left.get("ct") {
        let key = CtKey::from_str(ct.get("key")?.as_str()?).ok()?;
        return Some(Reg::Ct(key));
    }
    if let Some(fib) = left.get("fib") {
        let result = FibResult::from_str(fib.get("result")?.as_str()?).ok()?;
        let flag = FibFlag::from_str(fib.get("flags")?.as_array()?.first()?.as_str()?).ok()?;
        return Some(Reg::Fib(flag, result));
    }
    if let Some(p) = left.get("payload") {
        if let (Some(protocol), Some(field)) = (
            p.get("protocol").and_then(Value::as_str),
            p.get("field").and_then(Value::as_str),
        ) {
            let (base, offset, len) = match (protocol, field) {
                ("ip", "saddr") => (PayloadBase::Network, 12, 4),
                ("ip", "daddr") => (PayloadBase::Network, 16, 4),
                ("ip6", "saddr") => (PayloadBase::Network, 8, 16),
                ("ip6", "daddr") => (PayloadBase::Network, 24, 16),
                ("th" | "udp" | "tcp", "sport") => (PayloadBase::Transport, 0, 2),
                ("th" | "udp" | "tcp", "dport") => (PayloadBase::Transport, 2, 2),
                ("icmpv6", "type") => (PayloadBase::Transport, 0, 1),
                ("icmpv6", "code") => (PayloadBase::Transport, 1, 1),
                _ => return None,
            };
            return Some(Reg::Payload { base, offset, len });
        }
        let base = PayloadBase::from_str(p.get("base")?.as_str()?).ok()?;
        let offset = u32::try_from(p.get("offset")?.as_u64()? / 8).ok()?;
        let len = u32::try_from(p.get("len")?.as_u64()? / 8).ok()?;
        return Some(Reg::Payload { base, offset, len });
    }
    None
}

fn load_expr(reg: &Reg) -> Option<Expr> {
    Some(match reg {
        Reg::Meta(key) => Expr::Meta { key: *key },
        Reg::Ct(key) => Expr::Ct { key: *key },
        Reg::Fib(flag, result) => Expr::Fib {
            flag: *flag,
            result: *result,
        },
        Reg::Payload { base, offset, len } => Expr::Payload {
            base: *base,
            offset: *offset,
            len: *len,
        },
        _ => return None,
    })
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let digits = s.strip_prefix("0x")?;
    if digits.len() % 2 != 0 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

/// Inverse of [`lower_rhs`]: the bytes a register compare uses for `value`.
fn encode_rhs(reg: &Reg, value: &Value) -> Option<Vec<u8>> {
    if let Some(s) = value.as_str()
        && let Some(bytes) = parse_hex(s)
    {
        return Some(bytes);
    }
    match reg {
        Reg::Meta(MetaKey::Iifname | MetaKey::Oifname) => {
            Some(crate::core::matches::ifname(value.as_str()?))
        }
        Reg::Meta(MetaKey::Iiftype | MetaKey::Oiftype) => {
            let t = match value.as_str() {
                Some("loopback") => ARPHRD_LOOPBACK,
                _ => u16::try_from(value.as_u64()?).ok()?,
            };
            Some(t.to_ne_bytes().to_vec())
        }
        Reg::Meta(MetaKey::Nfproto) => Some(vec![match value.as_str() {
            Some("ipv4") => NFPROTO_IPV4,
            Some("ipv6") => NFPROTO_IPV6,
            _ => u8::try_from(value.as_u64()?).ok()?,
        }]),
        Reg::Meta(MetaKey::L4proto) => Some(vec![match value.as_str() {
            Some("udp") => IPPROTO_UDP,
            Some("tcp") => IPPROTO_TCP,
            Some("ipv6-icmp" | "icmpv6") => IPPROTO_ICMPV6,
            _ => u8::try_from(value.as_u64()?).ok()?,
        }]),
        Reg::Meta(MetaKey::Protocol) => {
            let p = match value.as_str() {
                Some("ip") => ETH_P_IP,
                Some("ip6") => ETH_P_IPV6,
                _ => u16::try_from(value.as_u64()?).ok()?,
            };
            Some(p.to_be_bytes().to_vec())
        }
        Reg::Meta(MetaKey::Mark | MetaKey::Cgroup) | Reg::Ct(CtKey::Mark) => {
            Some(u32::try_from(value.as_u64()?).ok()?.to_ne_bytes().to_vec())
        }
        Reg::Ct(CtKey::Zone) => Some(u16::try_from(value.as_u64()?).ok()?.to_ne_bytes().to_vec()),
        Reg::Fib(_, FibResult::AddrType) => {
            let t = match value.as_str() {
                Some(name) => fib_type_value(name)?,
                None => u32::try_from(value.as_u64()?).ok()?,
            };
            Some(t.to_ne_bytes().to_vec())
        }
        Reg::Fib(_, FibResult::Oif) => {
            Some(u32::try_from(value.as_u64()?).ok()?.to_ne_bytes().to_vec())
        }
        Reg::Payload { len, .. } => match *len {
            1 => Some(vec![u8::try_from(value.as_u64()?).ok()?]),
            2 => Some(u16::try_from(value.as_u64()?).ok()?.to_be_bytes().to_vec()),
            _ => match value.as_str()?.parse::<IpAddr>().ok()? {
                IpAddr::V4(a) => Some(a.octets().to_vec()),
                IpAddr::V6(a) => Some(a.octets().to_vec()),
            },
        },
        _ => None,
    }
}

fn decode_match(m: &Value) -> Option<Vec<Expr>> {
    let op = CmpOp::from_str(m.get("op")?.as_str()?).ok()?;
    let left = m.get("left")?;
    let right = m.get("right")?;

    if let Some(socket) = left.get("socket") {
        if socket.get("key")?.as_str()? != "cgroupv2" || op != CmpOp::Eq {
            return None;
        }
        let path = normalize_cgroup_path(right.as_str()?);
        return Some(vec![Expr::Match(cgroup_match(&path))]);
    }

    let reg = decode_load(left)?;
    let load = load_expr(&reg)?;

    // Set lookup
    if let Some(set) = right.as_str().and_then(|s| s.strip_prefix('@')) {
        return (op == CmpOp::Eq).then(|| {
            vec![
                load,
                Expr::Lookup {
                    set: set.to_string(),
                },
            ]
        });
    }

    // Address prefix
    if let Some(prefix) = right.get("prefix") {
        let addr: IpAddr = prefix.get("addr")?.as_str()?.parse().ok()?;
        let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
        let net = IpNetwork::new(addr, len).ok()?;
        let (mask, network) = match net {
            IpNetwork::V4(v4) => (v4.mask().octets().to_vec(), v4.network().octets().to_vec()),
            IpNetwork::V6(v6) => (v6.mask().octets().to_vec(), v6.network().octets().to_vec()),
        };
        let xor = vec![0; mask.len()];
        return Some(vec![
            load,
            Expr::Bitwise { mask, xor },
            Expr::Cmp { op, data: network },
        ]);
    }

    let data = encode_rhs(&reg, right)?;
    Some(vec![load, Expr::Cmp { op, data }])
}

fn decode_mangle(m: &Value) -> Option<Vec<Expr>> {
    let key = m.get("key")?;
    let value = m.get("value")?.as_u64()?;
    let (set, width) = if let Some(meta) = key.get("meta") {
        let k = MetaKey::from_str(meta.get("key")?.as_str()?).ok()?;
        (Expr::MetaSet { key: k }, k.width())
    } else if let Some(ct) = key.get("ct") {
        let k = CtKey::from_str(ct.get("key")?.as_str()?).ok()?;
        (Expr::CtSet { key: k }, k.width())
    } else {
        return None;
    };
    let data = match width {
        2 => u16::try_from(value).ok()?.to_ne_bytes().to_vec(),
        4 => u32::try_from(value).ok()?.to_ne_bytes().to_vec(),
        _ => return None,
    };
    Some(vec![Expr::Immediate { data }, set])
}

/// SHA-256 of the canonical JSON string, hex encoded.
pub fn fingerprint(batch: &Value) -> String {
    let json_str = serde_json::to_string(batch).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}
