use thiserror::Error;

/// Core error types for tunwall
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied value rejected before any model mutation
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Operation not permitted in the current engine state
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// nftables command execution failed or the backend rejected the batch
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Backend rejection without process details (in-memory backend, lookups)
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Nftables {
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }

    /// Integer status for callers that speak the errno-style contract.
    ///
    /// Success is `0` (see [`status`]); every failure is negative.
    pub fn code(&self) -> i32 {
        match self {
            Self::Validation { .. } => -22,
            Self::Precondition(_) => -1,
            Self::Elevation(_) => -13,
            Self::Nftables { .. } | Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => -5,
        }
    }
}

/// Maps any result onto the integer contract: `0` on success, `Error::code` otherwise.
pub fn status<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run tunwall as root or through sudo/run0")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes");
        }

        // Cache initialization failed (common with insufficient permissions)
        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges")
            .with_suggestion("Set TUNWALL_ELEVATION_METHOD to sudo, run0 or pkexec")
            .with_help("https://wiki.archlinux.org/title/Polkit");
        }

        // Missing nftables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Main_Page");
        }

        // Missing xt / cgroup support in the running kernel
        if lower.contains("cgroup") && (lower.contains("not supported") || lower.contains("no such")) {
            return ErrorTranslation::new("Kernel lacks cgroup socket matching")
                .with_suggestion("Load the xt_cgroup module: sudo modprobe xt_cgroup")
                .with_suggestion("Verify cgroup v2 is mounted at /sys/fs/cgroup");
        }

        // Syntax errors
        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Inspect the generated batch with: tunwall preview")
                .with_suggestion("Ensure IP addresses and network masks are valid")
                .with_help(
                    "https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management",
                );
        }

        // Table doesn't exist
        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("The 'tunwall' table may not have been created yet")
                .with_suggestion("Bring the tunnel up first: tunwall up")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_tables");
        }

        // Chain errors
        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Ensure the chain exists before adding rules to it")
                .with_suggestion("Another tool may have removed the tunwall table")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_chains");
        }

        // Invalid interface
        if lower.contains("interface")
            && (lower.contains("invalid") || lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Network interface not found or invalid")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // Invalid IP address
        if lower.contains("invalid")
            && (lower.contains("ip") || lower.contains("address") || lower.contains("network"))
        {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("For IPv6: 2001:db8::1 or 2001:db8::/32")
                .with_help("https://en.wikipedia.org/wiki/Classless_Inter-Domain_Routing");
        }

        // Resource busy
        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        // Netlink errors
        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
