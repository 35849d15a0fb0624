//! srelay: run the session origin, or borrow sessions from it as a peer.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use session_relay_core::config::{Config, LogFormat};
use session_relay_core::error::{ConfigError, Remediation, RemoteError};
use session_relay_core::logging::init_logging;
use session_relay_core::{
    EndpointConfig, InMemorySessionStore, LeaseCache, RemoteSessionClient, SessionRecord, SessionSerializer,
    run_session_endpoint,
};

/// Expired sessions are purged from the in-memory store this often.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "srelay", version, about = "Leased session sharing between an origin and a peer process")]
struct Cli {
    /// Config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "SESSION_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override general.log_level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override general.log_format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the session endpoint over an in-memory store
    Origin {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },

    /// Borrow sessions from a running origin
    Peer {
        #[command(subcommand)]
        action: PeerCommand,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PeerCommand {
    /// Print a session as JSON
    Get {
        /// Omit to have the origin issue a new session
        #[arg(long)]
        session_id: Option<String>,

        /// Read without taking the write lease
        #[arg(long)]
        read_only: bool,
    },

    /// Assign keys and commit
    Set {
        #[arg(long)]
        session_id: Option<String>,

        /// Assignments as KEY=JSON, e.g. `cart='[1,2]'` or `name='"ada"'`
        #[arg(required = true, value_name = "KEY=JSON")]
        assignments: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the default configuration as TOML
    Init,

    /// Load and validate the configuration
    Check,
}

#[derive(Serialize)]
struct SessionView<'a> {
    session_id: &'a str,
    is_new_session: bool,
    read_only: bool,
    timeout_ms: u64,
    values: &'a std::collections::BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    unknown_keys: &'a [String],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    set_cookie: &'a [String],
}

impl<'a> SessionView<'a> {
    fn new(record: &'a SessionRecord, set_cookie: &'a [String]) -> Self {
        Self {
            session_id: record.session_id(),
            is_new_session: record.is_new_session(),
            read_only: record.is_read_only(),
            timeout_ms: u64::try_from(record.timeout().as_millis()).unwrap_or(u64::MAX),
            values: record.values(),
            unknown_keys: record.unknown_keys(),
            set_cookie,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = remediation_for(&err) {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<session_relay_core::Error>() {
            e.remediation()
        } else if let Some(e) = cause.downcast_ref::<ConfigError>() {
            Some(e.remediation())
        } else {
            cause.downcast_ref::<RemoteError>().map(RemoteError::remediation)
        }
    })
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigCommand::Init,
    } = &cli.command
    {
        print!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let mut log = config.general.log_config();
    if let Some(level) = cli.log_level {
        log.level = level;
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).context("failed to initialize logging")?;

    match cli.command {
        Command::Origin { port, host } => run_origin(config, port, host).await,
        Command::Peer {
            action: PeerCommand::Get {
                session_id,
                read_only,
            },
        } => peer_get(&config, session_id.as_deref(), read_only).await,
        Command::Peer {
            action: PeerCommand::Set {
                session_id,
                assignments,
            },
        } => peer_set(&config, session_id.as_deref(), &assignments).await,
        Command::Config {
            action: ConfigCommand::Check,
        } => {
            config.validate()?;
            match &cli.config {
                Some(path) => println!("config ok: {}", path.display()),
                None => println!("config ok: defaults"),
            }
            Ok(())
        }
        Command::Config {
            action: ConfigCommand::Init,
        } => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("failed to load configuration")
}

async fn run_origin(mut config: Config, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.origin.port = port;
    }
    if let Some(host) = host {
        config.origin.host = host;
    }
    config.validate()?;

    let store = Arc::new(InMemorySessionStore::new(config.origin.session_timeout()));
    let serializer = SessionSerializer::new(config.serializer.options(config.origin.advertise_changesets));
    let leases = LeaseCache::new(serializer, store.clone());

    let purge_store = Arc::clone(&store);
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = purge_store.purge_expired();
            if purged > 0 {
                info!(target: "session_relay.store", purged, "purged expired sessions");
            }
        }
    });

    let result = run_session_endpoint(EndpointConfig::from_config(&config), leases).await;
    purger.abort();
    result.context("session endpoint failed")
}

fn peer_client(config: &Config) -> Result<RemoteSessionClient> {
    config.validate()?;
    Ok(RemoteSessionClient::from_config(config)?)
}

async fn peer_get(config: &Config, session_id: Option<&str>, read_only: bool) -> Result<()> {
    let client = peer_client(config)?;
    let session = client
        .acquire(session_id, read_only)
        .await
        .with_context(|| format!("failed to acquire session from {}", client.endpoint()))?;

    let rendered = serde_json::to_string_pretty(&SessionView::new(session.record(), session.set_cookie_headers()))?;
    session.release().await.context("failed to release session")?;
    println!("{rendered}");
    Ok(())
}

/// Parse `KEY=JSON` assignments. Keys must be non-empty.
fn parse_assignments(raw: &[String]) -> Result<Vec<(String, Value)>> {
    raw.iter()
        .map(|assignment| {
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=JSON, got '{assignment}'"))?;
            if key.is_empty() {
                return Err(anyhow!("empty key in assignment '{assignment}'"));
            }
            let value: Value = serde_json::from_str(value)
                .with_context(|| format!("value for '{key}' is not valid JSON: {value}"))?;
            Ok((key.to_string(), value))
        })
        .collect()
}

async fn peer_set(config: &Config, session_id: Option<&str>, raw: &[String]) -> Result<()> {
    let assignments = parse_assignments(raw)?;
    let client = peer_client(config)?;

    let outcome = client
        .with_session(session_id, false, move |record| {
            for (key, value) in assignments {
                record.set(key, value)?;
            }
            Ok(serde_json::to_value(SessionView::new(record, &[]))?)
        })
        .await
        .with_context(|| format!("failed to update session via {}", client.endpoint()))?;

    let mut view = outcome.value;
    if !outcome.set_cookie_headers.is_empty() {
        view["set_cookie"] = Value::from(outcome.set_cookie_headers);
    }
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
