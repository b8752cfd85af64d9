//! remoteplay - Console remote play streaming client

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use remoteplay::config::SessionConfig;
use remoteplay::network::{Event, EventReceiver, Session};

#[derive(Parser)]
#[command(name = "remoteplay")]
#[command(about = "Stream from a console over the LAN or the internet")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a console on the local network
    Connect {
        /// Console address (HOST or HOST:PORT)
        host: String,

        /// Registration key from pairing (hex)
        #[arg(long, env = "REMOTEPLAY_REGIST_KEY")]
        regist_key: Option<String>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Connect to a console over the internet through the relay
    Remote {
        /// OAuth access token
        #[arg(long, env = "REMOTEPLAY_TOKEN")]
        token: String,

        /// Space separated scopes granted to the token
        #[arg(long)]
        scopes: Option<String>,

        /// Console device id (64 hex characters)
        #[arg(long)]
        duid: String,

        /// Relay websocket URL (wss://...)
        #[arg(long)]
        relay_url: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Pre-shared registration secret (base64, 16 bytes)
    #[arg(long, env = "REMOTEPLAY_MORNING")]
    morning: Option<String>,

    /// Target is a PS5
    #[arg(long)]
    ps5: bool,

    /// Login PIN sent when the console asks for one
    #[arg(long)]
    pin: Option<String>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let builder = FmtSubscriber::builder().with_target(false);
    let result = if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())
    };
    result.context("Failed to set tracing subscriber")
}

fn base_config(common: &CommonArgs) -> Result<SessionConfig> {
    let mut config = match &common.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(morning) = &common.morning {
        config.morning = morning.clone();
    }
    // Without a config file the flag alone decides the console family
    if common.ps5 || common.config.is_none() {
        config.ps5 = common.ps5;
    }
    Ok(config)
}

fn build_config(command: &Commands) -> Result<(SessionConfig, Option<String>)> {
    match command {
        Commands::Connect {
            host,
            regist_key,
            common,
        } => {
            let mut config = base_config(common)?;
            config.host = Some(host.clone());
            config.holepunch = None;
            if let Some(regist_key) = regist_key {
                config.regist_key = regist_key.clone();
            }
            Ok((config, common.pin.clone()))
        }
        Commands::Remote {
            token,
            scopes,
            duid,
            relay_url,
            common,
        } => {
            let mut config = base_config(common)?;
            let mut settings = config.holepunch.take().unwrap_or_default();
            settings.access_token = token.clone();
            if let Some(scopes) = scopes {
                settings.token_scopes = scopes.clone();
            }
            settings.console_duid = duid.clone();
            settings.relay_url = relay_url.clone();
            config.holepunch = Some(settings);
            Ok((config, common.pin.clone()))
        }
    }
}

/// Print events until the session quits. Ctrl-C stops the session.
async fn run_session(session: &Session, mut events: EventReceiver, pin: Option<String>) -> Result<()> {
    let mut stopping = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Interrupted, stopping session");
                stopping = true;
                session.stop();
                continue;
            }
        };
        let Some(event) = event else {
            bail!("Session ended without a quit event");
        };

        match event {
            Event::Connected => info!("Connected, streaming"),
            Event::Quit { reason, message } => {
                let message = message.unwrap_or_default();
                if reason.is_error() {
                    bail!("Session failed: {} {}", reason, message);
                }
                info!("Session ended: {} {}", reason, message);
                return Ok(());
            }
            Event::LoginPinRequested { pin_incorrect } => {
                if pin_incorrect {
                    warn!("Console rejected the login PIN");
                    session.stop();
                    continue;
                }
                match &pin {
                    Some(pin) => {
                        if let Err(e) = session.set_login_pin(pin).await {
                            warn!("Failed to send login PIN: {}", e);
                        }
                    }
                    None => {
                        warn!("Console requires a login PIN, pass --pin");
                        session.stop();
                    }
                }
            }
            Event::RegistrationFinished { session_id } => {
                info!("Console session id: {}", session_id)
            }
            Event::HolepunchProgress(state) => info!("Holepunch: {}", state.name()),
            Event::NicknameReceived(nickname) => info!("Console nickname: {}", nickname),
            other => tracing::debug!("Event: {:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let (config, pin) = build_config(&cli.command)?;
    config.validate().context("Invalid configuration")?;

    let (session, events) = Session::new(config);
    session.start()?;
    let result = run_session(&session, events, pin).await;
    session.stop();
    session.join().await;
    result
}
