//! vpnpanel - VPN account provisioning CLI
//!
//! Creates, updates and removes user accounts across SSH, L2TP/IPsec,
//! IKEv2/IPsec, WireGuard and AnyConnect using the libvpnpanel backend.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use libvpnpanel::config::{PanelConfig, DEFAULT_CONFIG_PATH};
use libvpnpanel::protocol::{AccountRole, GrantSecret, ProtocolKind, Session};
use libvpnpanel::{secrets, validation};
use libvpnpanel::{GrantOutcome, PanelError, Provisioner, StatusReporter};
use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// PRIVILEGED OPERATIONS SECURITY
// ============================================================================

/// Commands that change native VPN configuration or system accounts.
/// These require running as root (UID 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrivilegedOp {
    AddUser,
    SetGrant,
    DeleteUser,
    ChangePassword,
    SetRole,
    RecordSession,
}

impl PrivilegedOp {
    fn description(&self) -> &'static str {
        match self {
            Self::AddUser => "add user",
            Self::SetGrant => "change protocol grant",
            Self::DeleteUser => "delete user",
            Self::ChangePassword => "change user password",
            Self::SetRole => "change user role",
            Self::RecordSession => "record session",
        }
    }
}

/// Check if running as root
fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn check_privileged_op(op: PrivilegedOp) -> Result<(), PanelError> {
    if is_root() {
        return Ok(());
    }

    Err(PanelError::PermissionDenied(format!(
        "Operation '{}' requires root privileges.\n\
         Run with sudo or as root user.",
        op.description()
    )))
}

fn get_required_privilege(command: &Commands) -> Option<PrivilegedOp> {
    match command {
        Commands::AddUser { .. } => Some(PrivilegedOp::AddUser),
        Commands::SetGrant { .. } => Some(PrivilegedOp::SetGrant),
        Commands::DeleteUser { .. } => Some(PrivilegedOp::DeleteUser),
        Commands::Passwd { .. } => Some(PrivilegedOp::ChangePassword),
        Commands::SetRole { .. } => Some(PrivilegedOp::SetRole),
        Commands::SessionOpen { .. } | Commands::SessionClose { .. } => Some(PrivilegedOp::RecordSession),
        _ => None,
    }
}

#[derive(Parser)]
#[command(name = "vpnpanel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "VPN panel - manage VPN user accounts across protocols", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and provision it on the given protocols
    AddUser {
        username: String,

        /// Protocol to enable (repeatable): ssh, l2tp, ikev2, wireguard, anyconnect
        #[arg(short, long = "protocol", value_name = "KIND")]
        protocols: Vec<ProtocolKind>,

        /// Read the account password from stdin instead of generating one
        #[arg(long)]
        password_stdin: bool,
    },

    /// Enable or disable one protocol for an account
    SetGrant {
        username: String,

        kind: ProtocolKind,

        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Revoke all protocols and delete the account
    DeleteUser {
        username: String,

        /// Delete even if some protocols could not be revoked
        #[arg(long)]
        force: bool,
    },

    /// List accounts and their grants
    ListUsers {
        #[arg(long)]
        json: bool,
    },

    /// Show one account
    ShowUser {
        username: String,

        #[arg(long)]
        json: bool,
    },

    /// Change an account password (read from stdin)
    Passwd { username: String },

    /// Change an account role: user or admin
    SetRole { username: String, role: AccountRole },

    /// Record a tunnel coming up (called from VPN connect hooks)
    SessionOpen {
        username: String,

        kind: ProtocolKind,

        /// Client address
        #[arg(long)]
        ip: IpAddr,
    },

    /// Record a tunnel going down
    SessionClose {
        username: String,

        /// Only close a session of this protocol
        #[arg(short, long = "protocol", value_name = "KIND")]
        protocol: Option<ProtocolKind>,
    },

    /// List open sessions
    Sessions {
        #[arg(short, long = "protocol", value_name = "KIND")]
        protocol: Option<ProtocolKind>,

        #[arg(long)]
        json: bool,
    },

    /// Per-protocol service health and drift
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Print the WireGuard client configuration of an account
    ClientConfig { username: String },

    /// List supported protocols
    Protocols,
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpnpanel={},libvpnpanel={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Single privilege check point
    if let Some(required_op) = get_required_privilege(&cli.command) {
        if let Err(e) = check_privileged_op(required_op) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    if let Commands::Protocols = cli.command {
        print_protocols();
        return Ok(());
    }

    let config = PanelConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let provisioner = if get_required_privilege(&cli.command).is_some() {
        config.ensure_directories()?;
        Provisioner::from_config(config).context("opening credential store")?
    } else {
        Provisioner::from_config_read_only(config).context("opening credential store")?
    };

    match &cli.command {
        Commands::AddUser { username, protocols, password_stdin } => {
            handle_add_user(&provisioner, username, protocols, *password_stdin).await
        }
        Commands::SetGrant { username, kind, enable, disable: _ } => {
            let outcome = provisioner.update_grant(username, *kind, *enable).await?;
            print_outcome(&outcome);
            if !outcome.is_ok() {
                bail!("{} grant for {} is {}", kind, username, outcome.status);
            }
            Ok(())
        }
        Commands::DeleteUser { username, force } => {
            let report = provisioner.delete_user(username, *force).await?;
            for outcome in &report.revoked {
                print_outcome(outcome);
            }
            if !report.leftover.is_empty() {
                eprintln!("Warning: native entries may remain for: {}", join_kinds(&report.leftover));
            }
            println!("Deleted {}", report.username);
            Ok(())
        }
        Commands::ListUsers { json } => handle_list_users(&provisioner, *json),
        Commands::ShowUser { username, json } => {
            let record = provisioner.get_user(username)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }
            println!("Username:   {}", record.account.username);
            println!("Role:       {}", record.account.role);
            println!("Created:    {}", record.account.created_at.to_rfc3339());
            println!(
                "Last login: {}",
                record.account.last_login.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("{:<12} {:<8} {:<9} {}", "PROTOCOL", "ENABLED", "STATUS", "LAST-ERROR");
            for grant in &record.grants {
                println!(
                    "{:<12} {:<8} {:<9} {}",
                    grant.kind,
                    if grant.enabled { "yes" } else { "no" },
                    grant.status,
                    grant.last_error.as_deref().unwrap_or("--")
                );
            }
            Ok(())
        }
        Commands::Passwd { username } => {
            let password = read_password_line().context("reading new password from stdin")?;
            provisioner.change_password(username, &password).await?;
            println!("Password changed for {}", username);
            Ok(())
        }
        Commands::SetRole { username, role } => {
            provisioner.set_role(username, *role).await?;
            println!("{} is now {}", username, role);
            Ok(())
        }
        Commands::SessionOpen { username, kind, ip } => {
            let session = provisioner.record_connect(username, *kind, *ip)?;
            println!("Opened session {} for {} over {}", session.id, username, kind);
            Ok(())
        }
        Commands::SessionClose { username, protocol } => {
            let session = provisioner.record_disconnect(username, *protocol)?;
            println!("Closed session {} for {} over {}", session.id, username, session.kind);
            Ok(())
        }
        Commands::Sessions { protocol, json } => {
            let sessions = provisioner.open_sessions(*protocol)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
            Ok(())
        }
        Commands::Status { json } => handle_status(&provisioner, *json).await,
        Commands::ClientConfig { username } => {
            print!("{}", provisioner.wireguard_client_config(username)?);
            Ok(())
        }
        Commands::Protocols => Ok(()),
    }
}

async fn handle_add_user(
    provisioner: &Provisioner,
    username: &str,
    protocols: &[ProtocolKind],
    password_stdin: bool,
) -> anyhow::Result<()> {
    validation::validate_username(username)?;

    let (password, generated) = if password_stdin {
        (read_password_line().context("reading password from stdin")?, false)
    } else {
        let length = provisioner.config().security.generated_password_length;
        (secrets::generate_password(length)?, true)
    };

    let report = provisioner.add_user(username, &password, protocols).await?;
    println!("Created {}", report.username);
    if generated {
        println!("Account password: {}", password);
    }
    for outcome in &report.grants {
        print_outcome(outcome);
    }

    if !report.all_active() {
        bail!("some protocols failed for {}", username);
    }
    Ok(())
}

fn handle_list_users(provisioner: &Provisioner, json: bool) -> anyhow::Result<()> {
    let users = provisioner.list_users()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }
    if users.is_empty() {
        println!("No users");
        return Ok(());
    }

    println!("{:<32} {:<6} {:<25} {:<25} {}", "USERNAME", "ROLE", "CREATED", "LAST-LOGIN", "PROTOCOLS");
    for user in users {
        let grants: Vec<String> = user
            .grants
            .iter()
            .map(|g| format!("{}:{}", g.kind, g.status))
            .collect();
        println!(
            "{:<32} {:<6} {:<25} {:<25} {}",
            user.account.username,
            user.account.role,
            user.account.created_at.format("%Y-%m-%d %H:%M:%S"),
            user.account
                .last_login
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
            if grants.is_empty() { "--".to_string() } else { grants.join(",") }
        );
    }
    Ok(())
}

async fn handle_status(provisioner: &Provisioner, json: bool) -> anyhow::Result<()> {
    let reporter = StatusReporter::new(provisioner.store().clone(), provisioner.registry().clone());
    let report = reporter.report().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<8} {:<7} {:<9} {}",
        "PROTOCOL", "INSTALLED", "RUNNING", "ACTIVE", "SESSIONS", "DRIFT"
    );
    for (kind, health) in &report {
        println!(
            "{:<12} {:<10} {:<8} {:<7} {:<9} {}",
            kind,
            if health.installed { "yes" } else { "no" },
            if health.running { "yes" } else { "no" },
            health.active_grant_count,
            health.open_sessions,
            health.drift.len()
        );
        for drift in &health.drift {
            println!("    {} stored={} observed={:?}", drift.username, drift.stored, drift.observed);
        }
    }
    Ok(())
}

fn print_protocols() {
    println!("{:<12} {:<18} {:<20} {:<24} {}", "KIND", "NAME", "SERVICE", "CONFIG", "PACKAGES");
    for kind in ProtocolKind::ALL {
        let d = kind.descriptor();
        println!(
            "{:<12} {:<18} {:<20} {:<24} {}",
            kind,
            d.display_name,
            d.service,
            d.config_path,
            d.packages.join(" ")
        );
    }
}

fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No open sessions");
        return;
    }
    println!("{:<32} {:<12} {:<40} {}", "USERNAME", "PROTOCOL", "CLIENT", "CONNECTED");
    for session in sessions {
        println!(
            "{:<32} {:<12} {:<40} {}",
            session.username,
            session.kind,
            session.client_ip,
            session.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("{} open session(s)", sessions.len());
}

fn print_outcome(outcome: &GrantOutcome) {
    match &outcome.error {
        Some(error) => println!("  {:<12} {:<9} {}", outcome.kind, outcome.status, error),
        None => println!("  {:<12} {}", outcome.kind, outcome.status),
    }

    match &outcome.secret {
        Some(GrantSecret::Password { password }) => println!("    password: {}", password),
        Some(GrantSecret::Psk { psk }) => println!("    psk: {}", psk),
        Some(GrantSecret::WireGuard { address, public_key, .. }) => {
            println!("    public key: {}", public_key);
            if let Some(address) = address {
                println!("    address: {}", address);
            }
            println!("    (run `vpnpanel client-config` for the full client file)");
        }
        None => {}
    }
}

fn join_kinds(kinds: &[ProtocolKind]) -> String {
    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

fn read_password_line() -> anyhow::Result<String> {
    let stdin = std::io::stdin();
    if atty::is(atty::Stream::Stdin) {
        eprint!("Password: ");
    }
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}
