#![forbid(unsafe_code)]

use clap::Parser;
use keyferry::config::{Cli, Commands};
use keyferry::pairing::{self, PairingUri, Registration};
use keyferry::sender::{self, control_payload, AgentReply, Sender};
use keyferry::Credentials;
use keyferry_proto::types::MsgType;
use keyferry_proto::DeviceKey;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Resolve the credentials path.
/// Checks platform-native config dir first, then falls back to ~/.config/keyferry/.
fn resolve_credentials_path(cli: &Cli) -> PathBuf {
    if let Some(ref path) = cli.credentials {
        return path.clone();
    }
    let filename = "credentials.json";
    let native = dirs::config_dir().map(|d| d.join("keyferry").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("keyferry").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    native.unwrap_or_else(|| PathBuf::from(filename))
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn read_secret(arg: Option<String>) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    if let Some(secret) = arg {
        return Ok(Zeroizing::new(secret.into_bytes()));
    }
    let mut buf = Zeroizing::new(Vec::new());
    std::io::stdin().read_to_end(&mut buf)?;
    while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
        buf.pop();
    }
    if buf.is_empty() {
        anyhow::bail!("no secret given on the command line or stdin");
    }
    Ok(buf)
}

// ── Commands ────────────────────────────────────────────────────────

async fn run_pair(
    cli: &Cli,
    uri: &str,
    device_id: Option<String>,
    agent_key: bool,
) -> anyhow::Result<()> {
    let uri = PairingUri::parse(uri)?;
    let deadline = Duration::from_secs(cli.timeout);
    let addr = uri.agent_addr();

    let stream = sender::connect_pair(&addr, deadline).await?;
    let registration = Registration {
        device_id,
        device_key: (!agent_key).then(DeviceKey::generate),
    };
    let paired = match pairing::pair(stream, &uri.token, registration, deadline).await {
        Ok(p) => p,
        Err(e) if pairing::needs_new_token(&e) => {
            anyhow::bail!("{e}; ask the agent for a new pairing token")
        }
        Err(e) => return Err(e.into()),
    };

    let path = resolve_credentials_path(cli);
    Credentials {
        agent: addr,
        device_id: paired.device_id.clone(),
        key: paired.key,
    }
    .save(&path)?;

    if tty() {
        println!();
        println!("  {GREEN}✓{RESET} Paired as {BOLD}{}{RESET}", paired.device_id);
        println!("  {DIM}Fingerprint{RESET}  {}", paired.fingerprint);
        println!("  {DIM}Credentials{RESET}  {}", path.display());
        println!();
    } else {
        println!("{}", paired.device_id);
    }
    Ok(())
}

async fn run_message(cli: &Cli, msg_type: MsgType, payload: &[u8]) -> anyhow::Result<AgentReply> {
    let credentials = Credentials::load(&resolve_credentials_path(cli))?;
    let mut sender = Sender::connect(credentials, Duration::from_secs(cli.timeout)).await?;
    Ok(sender.send(msg_type, payload).await?)
}

fn print_reply(reply: &AgentReply) -> ExitCode {
    if !tty() {
        println!("{reply}");
    } else if reply.is_ok() {
        println!("  {GREEN}✓{RESET} {reply}");
    } else if reply.is_clipboard() {
        println!("  {YELLOW}●{RESET} {reply}");
    } else {
        println!("  {RED}✗{RESET} {reply}");
    }
    if reply.is_ok() || reply.is_clipboard() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let secs = |ttl: Option<u64>| ttl.map(Duration::from_secs);
    let reply = match cli.command {
        Commands::Pair {
            ref uri,
            ref device_id,
            agent_key,
        } => {
            run_pair(&cli, uri, device_id.clone(), agent_key).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Send { ref secret } => {
            let secret = read_secret(secret.clone())?;
            run_message(&cli, MsgType::Inject, &secret).await?
        }
        Commands::Approve { ttl } => {
            run_message(&cli, MsgType::Approve, &control_payload(secs(ttl))).await?
        }
        Commands::Arm { ttl } => run_message(&cli, MsgType::Arm, &control_payload(secs(ttl))).await?,
        Commands::Disarm => run_message(&cli, MsgType::Disarm, &[]).await?,
    };
    Ok(print_reply(&reply))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} {e}");
                eprintln!();
            } else {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
