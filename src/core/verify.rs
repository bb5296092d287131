/// Verification module for nftables batches
///
/// Runs a rendered batch through `nft --json --check` so a broken rule set is
/// caught before the kill switch is engaged.
use crate::core::backend::nft::NftBackend;
use crate::core::error::Result;
use serde_json::Value;
use tracing::{info, warn};

/// Result of a batch verification operation
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Creates a successful verification result
    pub fn success() -> Self {
        Self {
            success: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Creates a failed verification result with errors
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            warnings: Vec::new(),
            errors,
        }
    }
}

/// Structural warnings that do not make nft reject the batch.
fn lint_batch(batch: &Value) -> Vec<String> {
    let cmds = batch
        .get("nftables")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut warnings = Vec::new();
    if cmds.is_empty() {
        warnings.push("batch is empty".to_string());
    }
    let has_drop_policy = cmds.iter().any(|c| {
        c.pointer("/add/chain/policy")
            .and_then(Value::as_str)
            .is_some_and(|p| p == "drop")
    });
    let adds_rules = cmds.iter().any(|c| c.pointer("/add/rule").is_some());
    if has_drop_policy && !adds_rules {
        warnings.push("drop-policy chains without any accept rules block all traffic".to_string());
    }
    warnings
}

/// Verifies a batch without applying it using `nft --json --check`
///
/// # Errors
///
/// Returns `Err` if:
/// - nft command cannot be executed
/// - JSON serialization fails
/// - Communication with nft process fails
pub fn verify_batch(nft: &NftBackend, batch: &Value) -> Result<VerifyResult> {
    let json_string = serde_json::to_string(batch)?;

    info!("Verifying batch via nft --json --check");
    let output = nft.run(&["--json", "--check", "-f", "-"], Some(&json_string))?;

    let mut result = if output.status.success() {
        info!("Batch verification passed");
        VerifyResult::success()
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Batch verification failed: {}", stderr);
        VerifyResult::failure(parse_nft_errors(&stderr))
    };
    result.warnings = lint_batch(batch);
    Ok(result)
}

/// Parses nft error output into user-friendly messages
///
/// Attempts to extract meaningful error information from nft's
/// stderr output, falling back to raw output if parsing fails.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    // Try to parse JSON error format first
    if let Ok(json_err) = serde_json::from_str::<serde_json::Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    // Fall back to line-by-line parsing
    stderr
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            // Clean up common nft error prefixes
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}
