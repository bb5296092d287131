use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default firewall mark for traffic excluded from the tunnel
pub const DEFAULT_FWMARK: u32 = 0xca6c;

/// Tunnel settings the kill switch is built from.
///
/// Addresses and prefixes stay strings here; the policy engine validates
/// them and reports the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    /// Address assigned to the tunnel, `addr` or `addr/len`
    #[serde(default)]
    pub ipv6_address: Option<String>,
    #[serde(default)]
    pub server_addresses: Vec<String>,
    /// Prefixes reachable outside the tunnel (LAN, for example)
    #[serde(default)]
    pub excluded_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_dhcp: bool,
    #[serde(default = "default_true")]
    pub block_dns: bool,
    #[serde(default = "default_true")]
    pub allow_ndp: bool,
    /// cgroup v2 paths whose traffic bypasses the tunnel
    #[serde(default)]
    pub excluded_cgroups: Vec<String>,
    /// cgroup v1 `net_cls` classid whose traffic bypasses the tunnel
    #[serde(default)]
    pub excluded_classid: Option<u32>,
    #[serde(default = "default_nft_path")]
    pub nft_path: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            fwmark: DEFAULT_FWMARK,
            ipv6_address: None,
            server_addresses: Vec::new(),
            excluded_prefixes: Vec::new(),
            allow_dhcp: true,
            block_dns: true,
            allow_ndp: true,
            excluded_cgroups: Vec::new(),
            excluded_classid: None,
            nft_path: default_nft_path(),
        }
    }
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_fwmark() -> u32 {
    DEFAULT_FWMARK
}

fn default_true() -> bool {
    true
}

/// nft binary, overridable by packagers at build time
fn default_nft_path() -> String {
    option_env!("TUNWALL_SYSTEM_NFT_PATH")
        .unwrap_or("nft")
        .to_string()
}

/// `$XDG_CONFIG_HOME/tunwall/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config at `path`, or the default config if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> crate::Result<TunnelConfig> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(TunnelConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if the directory is not writable or the rename fails.
pub fn save_config(config: &TunnelConfig, path: &Path) -> crate::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_string_pretty(config)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;

    // Tighten permissions before any data is written
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: TunnelConfig = serde_json::from_str(r#"{"interface":"tun0"}"#).unwrap();
        assert_eq!(config.interface, "tun0");
        assert_eq!(config.fwmark, DEFAULT_FWMARK);
        assert!(config.allow_dhcp && config.block_dns && config.allow_ndp);
        assert_eq!(config.nft_path, default_nft_path());
        assert!(config.excluded_classid.is_none());
    }

    #[test]
    fn test_missing_file_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, TunnelConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TunnelConfig {
            server_addresses: vec!["198.51.100.7".into()],
            excluded_prefixes: vec!["192.168.0.0/16".into()],
            excluded_cgroups: vec!["/user.slice/torrent.scope".into()],
            ipv6_address: Some("fd00::2/128".into()),
            ..TunnelConfig::default()
        };
        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path).unwrap_err().code(), -5);
    }
}
