//! Backend that drives the `nft` binary in JSON mode
//!
//! One `nft --json -f -` invocation per commit; nft applies the document as
//! a single kernel transaction.

use super::Backend;
use crate::core::error::{Error, Result};
use crate::core::nft_json::{decode_rules, decode_tables, render_batch};
use crate::core::transaction::{ListedRule, Op, TableRef};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::{debug, error, info};

/// How the nft process is started.
#[derive(Debug, Clone)]
enum Launcher {
    /// Elevated per [`crate::elevation`], with the configured binary path
    Elevated(String),
    /// Fixed program and leading arguments, no elevation (scripts, mocks)
    Direct { program: String, args: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct NftBackend {
    launcher: Launcher,
}

impl NftBackend {
    /// Runs `nft_path` through the elevation strategy.
    pub fn new(nft_path: impl Into<String>) -> Self {
        Self {
            launcher: Launcher::Elevated(nft_path.into()),
        }
    }

    /// Runs `program args... <nft args>` directly.
    pub fn with_program(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            launcher: Launcher::Direct {
                program: program.into(),
                args: args.iter().map(ToString::to_string).collect(),
            },
        }
    }

    fn command(&self, args: &[&str]) -> Result<Command> {
        match &self.launcher {
            Launcher::Elevated(path) => {
                Ok(crate::elevation::create_elevated_nft_command(path, args)?)
            }
            Launcher::Direct {
                program,
                args: leading,
            } => {
                let mut cmd = Command::new(program);
                cmd.args(leading).args(args);
                Ok(cmd)
            }
        }
    }

    /// Runs nft with `args`, optionally feeding `stdin`, and returns its output.
    ///
    /// A non-zero exit status is not an error here; see [`Self::run_checked`].
    pub fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        let mut child = self
            .command(args)?
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn nft: {e}");
                Error::Internal(format!("Failed to spawn nft: {e}"))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        Ok(child.wait_with_output()?)
    }

    fn run_checked(&self, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        let output = self.run(args, stdin)?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("nft {} failed: {stderr}", args.join(" "));
            Err(Error::Nftables {
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    fn run_json(&self, args: &[&str]) -> Result<Value> {
        let output = self.run_checked(args, None)?;
        serde_json::from_slice(&output.stdout).map_err(|e| {
            error!("Failed to parse nft listing: {e}");
            Error::Serialization(e)
        })
    }
}

impl Backend for NftBackend {
    fn list_tables(&self) -> Result<Vec<TableRef>> {
        decode_tables(&self.run_json(&["--json", "list", "tables"])?)
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<ListedRule>> {
        let family = table.family.to_string();
        decode_rules(&self.run_json(&[
            "--json",
            "--handle",
            "list",
            "chain",
            &family,
            &table.name,
            chain,
        ])?)
    }

    fn commit(&mut self, ops: &[Op]) -> Result<()> {
        let batch = serde_json::to_string(&render_batch(ops)?)?;
        debug!("Sending {} operation(s) to nft ({} bytes)", ops.len(), batch.len());
        self.run_checked(&["--json", "-f", "-"], Some(&batch))?;
        info!("nft accepted batch of {} operation(s)", ops.len());
        Ok(())
    }
}
