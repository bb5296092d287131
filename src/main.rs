//! tunwall - kill switch and split tunnel firewall for VPN clients
//!
//! # Usage
//!
//! ```bash
//! tunwall up                          # Build the kill switch from config.json
//! tunwall up --interface wg1 --dry-run  # Print the batch instead of applying it
//! tunwall down                        # Remove every tunwall table
//! tunwall preview                     # Print the complete nftables JSON batch
//! tunwall check                       # Validate the batch with nft --check
//! tunwall tables                      # List tables known to nft
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use shadow_rs::shadow;
use std::path::PathBuf;
use std::process::ExitCode;
use tunwall::config::{TunnelConfig, default_config_path, load_config};
use tunwall::core::backend::Backend;
use tunwall::core::backend::memory::MemoryBackend;
use tunwall::core::backend::nft::NftBackend;
use tunwall::core::error::NftablesErrorPattern;
use tunwall::core::nft_json::{fingerprint, render_batch};
use tunwall::core::policy::TABLE_NAME;
use tunwall::core::verify::verify_batch;
use tunwall::{Error, KillSwitch, audit, utils};

shadow!(build);

#[derive(Parser)]
#[command(name = "tunwall")]
#[command(about = "Kill switch and split tunnel firewall for VPN clients", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/tunwall/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to $XDG_STATE_HOME/tunwall/tunwall.log instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the kill switch and apply it to the kernel
    Up {
        /// Tunnel interface (overrides the config)
        #[arg(short, long)]
        interface: Option<String>,
        /// Firewall mark for excluded traffic (overrides the config)
        #[arg(long, value_parser = parse_mark)]
        fwmark: Option<u32>,
        /// Print the batch instead of applying it
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove every tunwall table
    Down,
    /// Print the batch `up` would apply
    Preview {
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Validate the `up` batch with nft --check without applying it
    Check,
    /// List tables known to nft
    Tables,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// Pretty-printed nftables JSON
    Json,
    /// One line per command
    Compact,
}

/// Accepts decimal or `0x` hexadecimal marks.
fn parse_mark(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid mark {value}: {e}"))
}

fn init_logging(verbose: bool, to_file: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if to_file
        && let Some(log_path) = utils::get_state_dir().map(|dir| dir.join("tunwall.log"))
        && let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
        return;
    }

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = utils::ensure_dirs();
    init_logging(cli.verbose, cli.log_file);

    match handle_cli(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Error::Nftables {
                stderr: Some(stderr),
                ..
            } = &e
            {
                let hint = NftablesErrorPattern::match_error(stderr);
                eprintln!("{}", hint.user_message);
                for suggestion in &hint.suggestions {
                    eprintln!("  - {suggestion}");
                }
                if let Some(url) = &hint.help_url {
                    eprintln!("  See {url}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn load(cli: &Cli) -> tunwall::Result<TunnelConfig> {
    match cli.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path),
        None => Ok(TunnelConfig::default()),
    }
}

/// Runs the full `up` sequence against an in-memory backend and returns the
/// equivalent single batch with its rule count.
fn preview_batch(config: &TunnelConfig) -> tunwall::Result<(Value, usize)> {
    let mut ks = KillSwitch::new(MemoryBackend::new());
    ks.up(config)?;
    let rules = ks.rule_count();
    let ops: Vec<_> = ks
        .into_engine()
        .into_backend()
        .commits()
        .iter()
        .flatten()
        .cloned()
        .collect();
    Ok((render_batch(&ops)?, rules))
}

fn print_batch(batch: &Value, format: Format) -> tunwall::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(batch)?),
        Format::Compact => {
            if let Some(cmds) = batch.get("nftables").and_then(Value::as_array) {
                for cmd in cmds {
                    println!("{}", serde_json::to_string(cmd)?);
                }
            }
        }
    }
    Ok(())
}

fn nft_backend(config: &TunnelConfig) -> NftBackend {
    if !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Will use sudo/run0/pkexec for nft.");
    }
    NftBackend::new(config.nft_path.as_str())
}

fn handle_cli(cli: &Cli) -> tunwall::Result<()> {
    match &cli.command {
        Commands::Up {
            interface,
            fwmark,
            dry_run,
        } => {
            let mut config = load(cli)?;
            if let Some(interface) = interface {
                config.interface.clone_from(interface);
            }
            if let Some(mark) = fwmark {
                config.fwmark = *mark;
            }

            let (batch, rules) = preview_batch(&config)?;
            if *dry_run {
                return print_batch(&batch, Format::Json);
            }

            let digest = fingerprint(&batch);
            let mut ks = KillSwitch::new(nft_backend(&config));
            let result = ks.up(&config);
            audit::log_up(
                &config.interface,
                rules,
                Some(&digest),
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            );
            result?;
            println!(
                "✓ Kill switch up on {} ({rules} rules, {})",
                config.interface,
                &digest[..12]
            );
        }
        Commands::Down => {
            let config = load(cli)?;
            let mut ks = KillSwitch::new(nft_backend(&config));
            let result = ks.down();
            audit::log_down(
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            );
            result?;
            println!("✓ Kill switch removed.");
        }
        Commands::Preview { format } => {
            let config = load(cli)?;
            let (batch, _) = preview_batch(&config)?;
            print_batch(&batch, *format)?;
        }
        Commands::Check => {
            let config = load(cli)?;
            let (batch, rules) = preview_batch(&config)?;
            let digest = fingerprint(&batch);

            println!("Verifying {rules} rules...");
            let result = verify_batch(&nft_backend(&config), &batch)?;
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
            audit::log_check(
                &digest,
                result.success,
                result.errors.len(),
                result.errors.first().cloned(),
            );
            if !result.success {
                return Err(Error::Nftables {
                    message: format!("verification failed:\n{}", result.errors.join("\n")),
                    stderr: Some(result.errors.join("\n")),
                    exit_code: Some(1),
                });
            }
            println!("✓ Batch {} is valid.", &digest[..12]);
        }
        Commands::Tables => {
            let config = load(cli)?;
            for table in nft_backend(&config).list_tables()? {
                let marker = if table.name == TABLE_NAME { "*" } else { " " };
                println!("  {marker} {table}");
            }
        }
    }
    Ok(())
}
