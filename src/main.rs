// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use atlas_guard::config::{config_dir, save_config, span_days, CONFIG_FILE};
use atlas_guard::security::password::hash_password;
use atlas_guard::server::Server;
use atlas_guard::{load_config, AtlasConfig, AtlasContext, AuthState, StoredUser};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// General error exit status (sysexits.h conventions)
const EXIT_ERROR: i32 = 1;

/// atlas - session and access guard for the histology atlas editor.
#[derive(Parser)]
#[command(name = "atlas")]
#[command(version = VERSION)]
#[command(about = "Session, lockout and route guard for the histology atlas editor.")]
#[command(long_about = "atlas - session and access guard for the histology atlas editor\n\n\
    Start the server:    atlas serve\n\
    Check status:        atlas status\n\
    Recent events:       atlas events --limit 20\n\
    Add a user:          atlas hash-password --username admin")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ~/.atlas/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose mode: debug logging (RUST_LOG overrides)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to (127.0.0.1 by default)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Show auth state, lockout and event counts
    #[command(alias = "s")]
    Status,

    /// Print recent security events
    Events {
        /// Number of events to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Empty the log instead
        #[arg(long)]
        clear: bool,
    },

    /// Export the security log as JSON
    Export {
        /// Output file (defaults to ./atlas_security_log_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Drop security events older than the retention period
    Prune {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u64>,
    },

    /// End the stored session
    Logout,

    /// Hash a password for the static user directory
    HashPassword {
        /// Print a ready-to-paste user entry for this username
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "atlas_guard=debug,atlas=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .init();
}

fn build_context(config: AtlasConfig) -> Result<AtlasContext> {
    let ctx = AtlasContext::from_config(config)?;
    ctx.initialize();
    Ok(ctx)
}

async fn serve(config: AtlasConfig, port: Option<u16>, bind: Option<String>) -> Result<()> {
    let ctx = Arc::new(build_context(config)?);

    println!();
    println!("{}", format!("=== atlas v{} ===", VERSION).bright_cyan().bold());
    println!("{} Auth state: {}", "[i]".blue(), ctx.auth.state());
    if ctx.config.media.is_none() {
        println!(
            "{} Media host not configured; image deletion will fail",
            "[!]".yellow()
        );
    }

    let mut server = Server::new(Arc::clone(&ctx));
    if let Some(port) = port {
        server = server.with_port(port);
    }
    if let Some(bind) = bind {
        server = server.with_bind_address(bind);
    }
    println!("{} Listening on port {}", "[OK]".green(), server.port());
    println!();

    server.start().await
}

fn show_status(config: AtlasConfig) -> Result<()> {
    let ctx = build_context(config)?;
    let now = ctx.clock.now();

    println!();
    println!("{}", "=== atlas Status ===".bright_cyan().bold());
    println!();

    match ctx.auth.state() {
        AuthState::Authenticated => {
            let user = ctx
                .auth
                .current_user()
                .map(|u| u.username)
                .unwrap_or_default();
            println!("{} Session: {} as {}", "[✓]".green(), "Active".green().bold(), user.bold());
            if let Ok(Some(record)) = ctx.auth.sessions().load() {
                let expires = record.created_at + ctx.auth.sessions().timeout();
                let left = expires - now;
                println!(
                    "{} Expires in {}h {}m",
                    "[i]".blue(),
                    left.num_hours(),
                    left.num_minutes() % 60
                );
            }
        }
        _ => println!("{} Session: {}", "[✗]".red(), "None".red()),
    }

    let lockout = ctx.auth.lockout();
    match lockout.remaining(now) {
        Some(left) => println!(
            "{} Login: {} ({}m {}s left)",
            "[!]".red(),
            "Locked".red().bold(),
            left.num_minutes(),
            left.num_seconds() % 60
        ),
        None => println!(
            "{} Login: open ({}/{} failed attempts)",
            "[i]".blue(),
            lockout.failed_attempts(),
            lockout.policy().max_attempts
        ),
    }

    let stats = ctx.events.stats();
    println!();
    println!("{}", "Security events".bold());
    println!("  Total:                 {}", stats.total);
    println!("  Page accesses:         {}", stats.page_accesses);
    println!("  Unauthorized attempts: {}", stats.unauthorized_attempts);
    println!("  Suspicious activity:   {}", stats.suspicious_activities);
    println!("  Session anomalies:     {}", stats.session_anomalies);
    if let Some(cleanup) = stats.last_cleanup {
        println!("  Last cleared:          {}", cleanup.format("%Y-%m-%d %H:%M"));
    }
    println!();
    Ok(())
}

fn show_events(config: AtlasConfig, limit: usize, clear: bool) -> Result<()> {
    let ctx = build_context(config)?;

    if clear {
        ctx.events.clear().context("Failed to clear the security log")?;
        println!("{} Security log cleared", "[OK]".green());
        return Ok(());
    }

    let events = ctx.events.persisted().context("Failed to read the security log")?;
    if events.is_empty() {
        println!("{}", "No security events recorded".dimmed());
        return Ok(());
    }

    let skip = events.len().saturating_sub(limit);
    for event in events.iter().skip(skip) {
        let line = event.to_log_line();
        match event.kind {
            atlas_guard::SecurityEventKind::PageAccess => println!("{}", line.dimmed()),
            atlas_guard::SecurityEventKind::UnauthorizedAttempt => println!("{}", line.yellow()),
            _ => println!("{}", line.red()),
        }
    }
    Ok(())
}

fn export_events(config: AtlasConfig, output: Option<PathBuf>) -> Result<()> {
    let ctx = build_context(config)?;
    let body = ctx.events.export().context("Failed to read the security log")?;

    let output = output.unwrap_or_else(|| {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        PathBuf::from(format!("atlas_security_log_{}.json", timestamp))
    });
    fs::write(&output, &body).with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} Exported security log to {} ({} bytes)",
        "[OK]".green(),
        output.display(),
        body.len()
    );
    Ok(())
}

fn prune_events(config: AtlasConfig, days: Option<u64>) -> Result<()> {
    let retention = match days {
        Some(days) => span_days(days),
        None => config.security.log_retention(),
    };
    let ctx = build_context(config)?;
    let removed = ctx.events.prune(ctx.clock.now(), retention);
    println!(
        "{} Removed {} event(s) older than {} days",
        "[OK]".green(),
        removed,
        retention.num_days()
    );
    Ok(())
}

fn logout(config: AtlasConfig) -> Result<()> {
    let ctx = build_context(config)?;
    let was_active = ctx.auth.is_authenticated();
    ctx.auth.logout();
    if was_active {
        println!("{} Session ended", "[OK]".green());
    } else {
        println!("{}", "No active session".dimmed());
    }
    Ok(())
}

fn handle_hash_password(username: Option<String>) -> Result<()> {
    let password = inquire::Password::new("Password:")
        .with_display_mode(inquire::PasswordDisplayMode::Masked)
        .with_validator(|input: &str| {
            if input.chars().count() < atlas_guard::security::auth::DEFAULT_MIN_PASSWORD_LEN {
                Ok(inquire::validator::Validation::Invalid(
                    "Password is too short.".into(),
                ))
            } else {
                Ok(inquire::validator::Validation::Valid)
            }
        })
        .prompt()
        .context("Password prompt cancelled")?;

    let hash = hash_password(&password).context("Failed to hash password")?;

    match username {
        Some(username) => {
            let user = StoredUser {
                id: username.trim().to_lowercase(),
                username: username.trim().to_lowercase(),
                password_hash: hash,
            };
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        None => println!("{}", hash),
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => config_dir()?.join(CONFIG_FILE),
    };
    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            "[!]".yellow(),
            path.display()
        );
        return Ok(());
    }
    save_config(&AtlasConfig::default(), &path)?;
    println!("{} Wrote {}", "[OK]".green(), path.display());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let path = cli.config;
    let load = || load_config(path.as_deref());

    match cli.command {
        Commands::Init { force } => init_config(path.clone(), force),
        Commands::Serve { port, bind } => {
            let config = load()?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(serve(config, port, bind))
        }
        Commands::Status => show_status(load()?),
        Commands::Events { limit, clear } => show_events(load()?, limit, clear),
        Commands::Export { output } => export_events(load()?, output),
        Commands::Prune { days } => prune_events(load()?, days),
        Commands::Logout => logout(load()?),
        Commands::HashPassword { username } => handle_hash_password(username),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "[X]".red(), e);
        std::process::exit(EXIT_ERROR);
    }
    Ok(())
}
