use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the desktop agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "keyferryd")]
#[command(about = "Receives secrets from a paired phone and types them into the focused window")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:47800", env = "KEYFERRY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint. Disabled when unset.
    #[arg(long, env = "KEYFERRY_METRICS")]
    pub metrics_addr: Option<SocketAddr>,
    /// Host advertised in the pairing URI. Defaults to the listen address.
    #[arg(long, env = "KEYFERRY_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,
    /// Maximum concurrent connections.
    #[arg(long, default_value = "64", env = "KEYFERRY_MAX_CONNS")]
    pub max_conns: usize,
    /// Requests admitted per origin IP per rate window.
    #[arg(long, default_value = "30", env = "KEYFERRY_RATE_LIMIT")]
    pub rate_limit: u32,
    /// Rate window in seconds.
    #[arg(long, default_value = "60", env = "KEYFERRY_RATE_WINDOW")]
    pub rate_window: u64,
    /// Maximum message age in seconds.
    #[arg(long, default_value = "120", env = "KEYFERRY_REPLAY_WINDOW")]
    pub replay_window: u64,
    /// Tolerated sender clock lead in seconds.
    #[arg(long, default_value = "30", env = "KEYFERRY_CLOCK_SKEW")]
    pub clock_skew: u64,
    /// Arm window in seconds when an Arm message carries no TTL.
    #[arg(long, default_value = "60", env = "KEYFERRY_ARM_TTL")]
    pub arm_ttl: u64,
    /// Upper bound on a requested arm window, seconds.
    #[arg(long, default_value = "600", env = "KEYFERRY_MAX_ARM_TTL")]
    pub max_arm_ttl: u64,
    /// Approval window in seconds when an Approve message carries no TTL.
    #[arg(long, default_value = "60", env = "KEYFERRY_APPROVAL_TTL")]
    pub approval_ttl: u64,
    /// Upper bound on a requested approval window, seconds.
    #[arg(long, default_value = "600", env = "KEYFERRY_MAX_APPROVAL_TTL")]
    pub max_approval_ttl: u64,
    /// Lifetime of a pairing token in seconds.
    #[arg(long, default_value = "300", env = "KEYFERRY_PAIRING_TTL")]
    pub pairing_ttl: u64,
    /// Deadline for the connection preamble, seconds.
    #[arg(long, default_value = "5", env = "KEYFERRY_PREAMBLE_TIMEOUT")]
    pub preamble_timeout: u64,
    /// Deadline for each pairing step, seconds.
    #[arg(long, default_value = "30", env = "KEYFERRY_PAIR_TIMEOUT")]
    pub pair_timeout: u64,
    /// Deadline for reading one message once it has started, seconds.
    #[arg(long, default_value = "10", env = "KEYFERRY_READ_TIMEOUT")]
    pub read_timeout: u64,
    /// Deadline for writing a reply, seconds.
    #[arg(long, default_value = "10", env = "KEYFERRY_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Idle time between messages before the connection is dropped, seconds.
    #[arg(long, default_value = "30", env = "KEYFERRY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Deadline for one injection, including waiting for the injection
    /// lock, seconds. Helper programs are killed when it expires.
    #[arg(long, default_value = "10", env = "KEYFERRY_INJECT_TIMEOUT")]
    pub inject_timeout: u64,
    /// Refuse injection unless an arm window is open.
    #[arg(long, env = "KEYFERRY_REQUIRE_ARM")]
    pub require_arm: bool,
    /// Refuse injection unless the sending device has an approval window.
    #[arg(long, env = "KEYFERRY_REQUIRE_APPROVAL")]
    pub require_approval: bool,
    /// Close the arm window after one successful injection.
    #[arg(long, env = "KEYFERRY_CONSUME_ARM")]
    pub consume_arm: bool,
    /// Close the approval window after one successful injection.
    #[arg(long, env = "KEYFERRY_CONSUME_APPROVAL")]
    pub consume_approval: bool,
    /// Put the secret on the clipboard when a gate blocks injection.
    #[arg(long, env = "KEYFERRY_CLIPBOARD_ON_BLOCK")]
    pub clipboard_on_block: bool,
    /// Generate a fresh key when an already-paired device pairs again.
    #[arg(long, env = "KEYFERRY_ROTATE_ON_REPAIR")]
    pub rotate_on_repair: bool,
    /// Allowed foreground targets (substring of process or title).
    #[arg(long = "allow-target", env = "KEYFERRY_ALLOW_TARGETS", value_delimiter = ',')]
    pub allow_targets: Vec<String>,
    /// Denied foreground targets (substring of process or title).
    #[arg(long = "deny-target", env = "KEYFERRY_DENY_TARGETS", value_delimiter = ',')]
    pub deny_targets: Vec<String>,
    /// Directory for the device store and machine key.
    #[arg(long, env = "KEYFERRY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    /// Keep paired devices in memory only.
    #[arg(long, env = "KEYFERRY_EPHEMERAL")]
    pub ephemeral: bool,
    /// Store device keys as plain JSON instead of sealing them.
    #[arg(long, env = "KEYFERRY_ALLOW_INSECURE_STORE")]
    pub allow_insecure_store: bool,
    /// Injector command; repeat to build a fallback chain. The secret is
    /// written to its stdin.
    #[arg(long = "inject-cmd", env = "KEYFERRY_INJECT_CMDS", value_delimiter = ';')]
    pub inject_cmds: Vec<String>,
    /// Clipboard command; the secret is written to its stdin.
    #[arg(long, env = "KEYFERRY_CLIPBOARD_CMD")]
    pub clipboard_cmd: Option<String>,
    /// Focus command printing `process<TAB>title`.
    #[arg(long, env = "KEYFERRY_FOCUS_CMD")]
    pub focus_cmd: Option<String>,
    /// Issue a pairing token at start-up and print the pairing URI. Implied
    /// when no device is paired yet.
    #[arg(long)]
    pub pair: bool,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to a file instead of stderr.
    #[arg(long, env = "KEYFERRY_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum concurrent connections.
    pub max_conns: usize,
    /// Requests admitted per origin per window.
    pub rate_limit: u32,
    /// Rate window, milliseconds.
    pub rate_window_ms: u64,
    /// Maximum message age, milliseconds.
    pub replay_window_ms: u64,
    /// Tolerated sender clock lead, milliseconds.
    pub max_clock_skew_ms: u64,
    /// Default arm window, milliseconds.
    pub arm_ttl_ms: u64,
    /// Upper bound on a requested arm window, milliseconds.
    pub max_arm_ttl_ms: u64,
    /// Default approval window, milliseconds.
    pub approval_ttl_ms: u64,
    /// Upper bound on a requested approval window, milliseconds.
    pub max_approval_ttl_ms: u64,
    /// Pairing token lifetime, milliseconds.
    pub pairing_ttl_ms: u64,
    /// Preamble deadline.
    pub preamble_timeout: Duration,
    /// Per-step pairing deadline.
    pub pair_timeout: Duration,
    /// Per-message read deadline.
    pub read_timeout: Duration,
    /// Reply write deadline.
    pub write_timeout: Duration,
    /// Idle deadline between messages.
    pub idle_timeout: Duration,
    /// Injection deadline, lock wait and helper run each bounded by it.
    pub inject_timeout: Duration,
    /// Injection requires an open arm window.
    pub require_arm: bool,
    /// Injection requires an open approval window for the device.
    pub require_approval: bool,
    /// A successful injection closes the arm window.
    pub consume_arm: bool,
    /// A successful injection closes the device's approval window.
    pub consume_approval: bool,
    /// Fall back to the clipboard when a gate blocks.
    pub clipboard_on_block: bool,
    /// Re-pairing an existing device id generates a fresh key.
    pub rotate_on_repair: bool,
    /// Allowed foreground targets.
    pub allow_targets: Vec<String>,
    /// Denied foreground targets.
    pub deny_targets: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 47800)),
            metrics_addr: None,
            max_conns: 64,
            rate_limit: 30,
            rate_window_ms: 60_000,
            replay_window_ms: 120_000,
            max_clock_skew_ms: 30_000,
            arm_ttl_ms: 60_000,
            max_arm_ttl_ms: 600_000,
            approval_ttl_ms: 60_000,
            max_approval_ttl_ms: 600_000,
            pairing_ttl_ms: 300_000,
            preamble_timeout: Duration::from_secs(5),
            pair_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            inject_timeout: Duration::from_secs(10),
            require_arm: false,
            require_approval: false,
            consume_arm: false,
            consume_approval: false,
            clipboard_on_block: false,
            rotate_on_repair: false,
            allow_targets: Vec::new(),
            deny_targets: Vec::new(),
        }
    }
}

const DAY_MS: u64 = 86_400_000;

fn check_range(name: &str, value: u64, max: u64) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{name} must be greater than 0"));
    }
    if value > max {
        return Err(format!("{name} exceeds reasonable limit ({max})"));
    }
    Ok(())
}

fn check_timeout(name: &str, value: Duration) -> Result<(), String> {
    if value.is_zero() {
        return Err(format!("{name} must be greater than 0"));
    }
    if value > Duration::from_secs(3600) {
        return Err(format!("{name} exceeds reasonable limit (3600 seconds)"));
    }
    Ok(())
}

impl AgentConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 10_000 {
            return Err("max_conns exceeds reasonable limit (10,000)".to_string());
        }

        check_range("rate_limit", u64::from(self.rate_limit), 100_000)?;
        check_range("rate_window", self.rate_window_ms, DAY_MS)?;
        check_range("replay_window", self.replay_window_ms, DAY_MS)?;
        if self.max_clock_skew_ms > self.replay_window_ms {
            return Err("clock_skew cannot exceed replay_window".to_string());
        }

        check_range("max_arm_ttl", self.max_arm_ttl_ms, DAY_MS)?;
        check_range("arm_ttl", self.arm_ttl_ms, self.max_arm_ttl_ms)?;
        check_range("max_approval_ttl", self.max_approval_ttl_ms, DAY_MS)?;
        check_range("approval_ttl", self.approval_ttl_ms, self.max_approval_ttl_ms)?;
        check_range("pairing_ttl", self.pairing_ttl_ms, DAY_MS)?;

        check_timeout("preamble_timeout", self.preamble_timeout)?;
        check_timeout("pair_timeout", self.pair_timeout)?;
        check_timeout("read_timeout", self.read_timeout)?;
        check_timeout("write_timeout", self.write_timeout)?;
        check_timeout("idle_timeout", self.idle_timeout)?;
        check_timeout("inject_timeout", self.inject_timeout)?;

        if self.consume_arm && !self.require_arm {
            return Err("consume_arm requires require_arm".to_string());
        }
        if self.consume_approval && !self.require_approval {
            return Err("consume_approval requires require_approval".to_string());
        }
        Ok(())
    }
}

impl From<Args> for AgentConfig {
    fn from(args: Args) -> Self {
        let ms = |secs: u64| secs.saturating_mul(1000);
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            rate_limit: args.rate_limit,
            rate_window_ms: ms(args.rate_window),
            replay_window_ms: ms(args.replay_window),
            max_clock_skew_ms: ms(args.clock_skew),
            arm_ttl_ms: ms(args.arm_ttl),
            max_arm_ttl_ms: ms(args.max_arm_ttl),
            approval_ttl_ms: ms(args.approval_ttl),
            max_approval_ttl_ms: ms(args.max_approval_ttl),
            pairing_ttl_ms: ms(args.pairing_ttl),
            preamble_timeout: Duration::from_secs(args.preamble_timeout),
            pair_timeout: Duration::from_secs(args.pair_timeout),
            read_timeout: Duration::from_secs(args.read_timeout),
            write_timeout: Duration::from_secs(args.write_timeout),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            inject_timeout: Duration::from_secs(args.inject_timeout),
            require_arm: args.require_arm,
            require_approval: args.require_approval,
            consume_arm: args.consume_arm,
            consume_approval: args.consume_approval,
            clipboard_on_block: args.clipboard_on_block,
            rotate_on_repair: args.rotate_on_repair,
            allow_targets: args.allow_targets,
            deny_targets: args.deny_targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn args_defaults_match_config_defaults() {
        let args = Args::parse_from(["keyferryd"]);
        let c: AgentConfig = args.into();
        let d = AgentConfig::default();
        assert_eq!(c.listen, d.listen);
        assert_eq!(c.replay_window_ms, d.replay_window_ms);
        assert_eq!(c.arm_ttl_ms, d.arm_ttl_ms);
        assert_eq!(c.idle_timeout, d.idle_timeout);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn target_lists_split_on_commas() {
        let args = Args::parse_from(["keyferryd", "--allow-target", "keepass,firefox"]);
        assert_eq!(args.allow_targets, vec!["keepass", "firefox"]);
    }

    #[test]
    fn max_conns_zero() {
        let mut c = AgentConfig::default();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_too_large() {
        let mut c = AgentConfig::default();
        c.max_conns = 10_001;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn rate_limit_zero() {
        let mut c = AgentConfig::default();
        c.rate_limit = 0;
        assert!(c.validate().unwrap_err().contains("rate_limit"));
    }

    #[test]
    fn replay_window_zero() {
        let mut c = AgentConfig::default();
        c.replay_window_ms = 0;
        assert!(c.validate().unwrap_err().contains("replay_window"));
    }

    #[test]
    fn skew_larger_than_window() {
        let mut c = AgentConfig::default();
        c.max_clock_skew_ms = c.replay_window_ms + 1;
        assert!(c.validate().unwrap_err().contains("clock_skew"));
    }

    #[test]
    fn default_arm_ttl_above_max() {
        let mut c = AgentConfig::default();
        c.arm_ttl_ms = c.max_arm_ttl_ms + 1;
        assert!(c.validate().unwrap_err().contains("arm_ttl"));
    }

    #[test]
    fn approval_ttl_zero() {
        let mut c = AgentConfig::default();
        c.approval_ttl_ms = 0;
        assert!(c.validate().unwrap_err().contains("approval_ttl"));
    }

    #[test]
    fn timeout_zero() {
        let mut c = AgentConfig::default();
        c.idle_timeout = Duration::ZERO;
        assert!(c.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn timeout_too_large() {
        let mut c = AgentConfig::default();
        c.pair_timeout = Duration::from_secs(3601);
        assert!(c.validate().unwrap_err().contains("pair_timeout"));
    }

    #[test]
    fn inject_timeout_flag() {
        let args = Args::parse_from(["keyferryd", "--inject-timeout", "3"]);
        let c: AgentConfig = args.into();
        assert_eq!(c.inject_timeout, Duration::from_secs(3));
        let mut c = AgentConfig::default();
        c.inject_timeout = Duration::ZERO;
        assert!(c.validate().unwrap_err().contains("inject_timeout"));
    }

    #[test]
    fn consume_without_require() {
        let mut c = AgentConfig::default();
        c.consume_arm = true;
        assert!(c.validate().unwrap_err().contains("consume_arm"));
        c.require_arm = true;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = AgentConfig::default();
        c.max_conns = 1;
        c.rate_limit = 1;
        c.rate_window_ms = 1;
        c.replay_window_ms = 1;
        c.max_clock_skew_ms = 0;
        c.arm_ttl_ms = 1;
        c.max_arm_ttl_ms = 1;
        c.approval_ttl_ms = 1;
        c.max_approval_ttl_ms = 1;
        c.pairing_ttl_ms = 1;
        assert!(c.validate().is_ok());
    }
}
