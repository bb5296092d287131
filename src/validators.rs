//! Input validation for policy parameters
//!
//! Every caller-supplied value is checked here before the rule-set model is
//! touched, so a rejected operation never leaves half-built rules behind.
//! Functions return `Result<T, String>`; the policy engine wraps the message
//! in [`crate::Error::Validation`] with the field name.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroU32;

/// Maximum interface name length (`IFNAMSIZ` minus the terminator)
pub const MAX_IFNAME_LEN: usize = 15;

/// Validates a network interface name.
///
/// # Examples
///
/// ```
/// use tunwall::validators::validate_interface;
///
/// assert_eq!(validate_interface("wg0").unwrap(), "wg0");
/// assert!(validate_interface("").is_err());
/// assert!(validate_interface("eth0; rm -rf /").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 15 bytes, `.`/`..`, or
/// contains characters other than ASCII alphanumerics, dot, dash and underscore.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is required".to_string());
    }

    if name.len() > MAX_IFNAME_LEN {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    // Check for valid characters (ASCII alphanumeric only, plus dot, dash, underscore)
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Firewall marks must be non-zero: zero means "unmarked" to the kernel.
pub fn validate_fwmark(mark: u32) -> Result<NonZeroU32, String> {
    NonZeroU32::new(mark).ok_or_else(|| "Firewall mark must be non-zero".to_string())
}

/// cgroup v1 `net_cls` classids must be non-zero: zero matches unclassified sockets.
pub fn validate_classid(classid: u32) -> Result<u32, String> {
    if classid == 0 {
        return Err("cgroup classid must be non-zero".to_string());
    }
    Ok(classid)
}

/// Validates a cgroup v2 path and returns it in canonical `/a/b` form.
///
/// Paths longer than the kernel's 511 byte limit are accepted here; the match
/// encoder truncates them.
pub fn validate_cgroup_path(path: &str) -> Result<String, String> {
    if path.is_empty() {
        return Err("cgroup path is required".to_string());
    }
    if path.contains('\0') {
        return Err("cgroup path contains a NUL byte".to_string());
    }
    Ok(crate::core::matches::normalize_cgroup_path(path))
}

/// Parses a VPN server address; only IPv4 is supported by the server set.
pub fn parse_server_address(value: &str) -> Result<Ipv4Addr, String> {
    match value.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(_)) => Err(format!("{value}: server set holds IPv4 addresses only")),
        Err(_) => Err(format!("{value}: invalid IP address")),
    }
}

/// Parses a CIDR prefix (`10.0.0.0/8`, `fd00::/8`); a bare address is a host prefix.
pub fn parse_prefix(value: &str) -> Result<IpNetwork, String> {
    value
        .trim()
        .parse::<IpNetwork>()
        .map_err(|e| format!("{value}: invalid CIDR prefix ({e})"))
}

/// Parses the tunnel's IPv6 address, accepting and discarding a `/len` suffix.
pub fn parse_tunnel_address(value: &str) -> Result<Ipv6Addr, String> {
    match crate::core::matches::strip_prefix_len(value) {
        Some(IpAddr::V6(addr)) => Ok(addr),
        Some(IpAddr::V4(_)) => Err(format!("{value}: tunnel address must be IPv6")),
        None => Err(format!("{value}: invalid IPv6 address")),
    }
}

/// Informational warning for prefixes excluded from the tunnel.
///
/// Does not block the operation; the caller logs it.
pub fn check_excluded_prefix(net: IpNetwork) -> Option<String> {
    if net.prefix() == 0 {
        return Some(format!(
            "{net} excludes every destination of its family from the kill switch"
        ));
    }

    match net.ip() {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();

            // RFC 1918 private ranges
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return None;
            }

            if octets[0] == 127 {
                return Some("Loopback range (127.x) - loopback is always allowed".to_string());
            }

            if net.prefix() < 8 {
                return Some(format!("{net} is a very broad public range"));
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1) - loopback is always allowed".to_string());
            }

            if net.prefix() < 16 && ipv6.segments()[0] & 0xffc0 != 0xfe80 {
                return Some(format!("{net} is a very broad public range"));
            }

            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_interface() {
        assert_eq!(validate_interface("wg0").unwrap(), "wg0");
        assert_eq!(validate_interface("tun-vpn.1_a").unwrap(), "tun-vpn.1_a");
        assert_eq!(validate_interface("a".repeat(15).as_str()).unwrap().len(), 15);
    }

    #[test]
    fn test_validate_interface_rejects() {
        assert!(validate_interface("").is_err());
        assert!(validate_interface(&"a".repeat(16)).is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("wg 0").is_err());
        assert!(validate_interface("wg0\"").is_err());
        assert!(validate_interface("wgö").is_err());
    }

    #[test]
    fn test_validate_fwmark() {
        assert!(validate_fwmark(0).is_err());
        assert_eq!(validate_fwmark(0xca6c).unwrap().get(), 0xca6c);
    }

    #[test]
    fn test_validate_classid_and_path() {
        assert!(validate_classid(0).is_err());
        assert_eq!(validate_classid(0x0010_0001), Ok(0x0010_0001));
        assert!(validate_cgroup_path("").is_err());
        assert!(validate_cgroup_path("/a\0b").is_err());
        assert!(validate_cgroup_path(&"x".repeat(700)).is_ok());
        assert_eq!(
            validate_cgroup_path("user.slice/app.scope").unwrap(),
            "/user.slice/app.scope"
        );
        assert_eq!(validate_cgroup_path("//a").unwrap(), "/a");
    }

    #[test]
    fn test_parse_server_address() {
        assert_eq!(
            parse_server_address(" 198.51.100.7 "),
            Ok(Ipv4Addr::new(198, 51, 100, 7))
        );
        assert!(parse_server_address("2001:db8::1").unwrap_err().contains("IPv4"));
        assert!(parse_server_address("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_prefix() {
        let net = parse_prefix("192.168.1.0/24").unwrap();
        assert_eq!(net.prefix(), 24);
        assert_eq!(parse_prefix("10.0.0.1").unwrap().prefix(), 32);
        assert!(parse_prefix("10.0.0.0/33").is_err());
        assert!(parse_prefix("garbage").is_err());
    }

    #[test]
    fn test_parse_tunnel_address() {
        assert_eq!(
            parse_tunnel_address("fd00:6d:6f7a::2/128"),
            Ok("fd00:6d:6f7a::2".parse().unwrap())
        );
        assert!(parse_tunnel_address("10.64.0.2/32").is_err());
        assert!(parse_tunnel_address("::zz").is_err());
    }

    #[test]
    fn test_check_excluded_prefix() {
        assert!(check_excluded_prefix(parse_prefix("0.0.0.0/0").unwrap()).is_some());
        assert!(check_excluded_prefix(parse_prefix("192.168.0.0/16").unwrap()).is_none());
        assert!(check_excluded_prefix(parse_prefix("fe80::/10").unwrap()).is_none());
        assert!(check_excluded_prefix(parse_prefix("2000::/3").unwrap()).is_some());
    }
}
