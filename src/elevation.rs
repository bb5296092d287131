//! Privilege elevation for nft invocations
//!
//! tunwall can run as an unprivileged user and elevates only to run `nft`.
//!
//! # Elevation Strategy
//!
//! - **Root**: runs `nft` directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `TUNWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for VPN daemons with sudoers NOPASSWD rules.
//! - `TUNWALL_NFT_COMMAND`: Program to run instead of the configured `nft` path.
//! - `TUNWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Example
//!
//! ```no_run
//! use tunwall::elevation::create_elevated_nft_command;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_nft_command("nft", &["--json", "list", "tables"])?;
//! let output = cmd.output()?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `TUNWALL_ELEVATION_METHOD`
    #[error("Invalid TUNWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(e: ElevationError) -> Self {
        Self::Elevation(e.to_string())
    }
}

/// Checks if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Resolves the nft program: `TUNWALL_NFT_COMMAND` wins over the configured path.
pub fn nft_program(configured: &str) -> String {
    match std::env::var("TUNWALL_NFT_COMMAND") {
        Ok(cmd) if !cmd.trim().is_empty() => cmd,
        _ => configured.to_string(),
    }
}

fn wrapped(elevator: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("TUNWALL_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("TUNWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

/// Creates an elevated `nft` command with the specified arguments
///
/// `nft_path` is the configured binary; `TUNWALL_NFT_COMMAND` overrides it.
/// Arguments are passed directly without shell interpretation.
pub fn create_elevated_nft_command(
    nft_path: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(nft_path), args)
}
