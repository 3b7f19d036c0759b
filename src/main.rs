use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn};
use tracing_appender::non_blocking::WorkerGuard;

use groupchat_adapter::bridge::Bridge;
use groupchat_adapter::bus::BusClient;
use groupchat_adapter::config::{
    AdapterConfig, BusConfig, XmppConfig, DEFAULT_CHAT_HOST, DEFAULT_CHAT_PORT, DEFAULT_RESOURCE,
};
use groupchat_adapter::xmpp::{self, lifecycle};

/// Bounded depth of the channels between tasks.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "groupchat-adapter", version, about = "Connects a hosted group chat account to a bot bus server")]
struct Cli {
    /// Chat service user name (without domain)
    #[arg(long)]
    user: String,

    /// Chat service password
    #[arg(long, env = "CHAT_PASSWORD", hide_env_values = true)]
    pass: String,

    /// Full name used as the nick in rooms
    #[arg(long, default_value = "Groupchat Bot")]
    nick: String,

    /// Bus server host
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    /// Bus server port
    #[arg(long, default_value_t = 4517)]
    port: u16,

    /// Source id announced on the bus
    #[arg(long = "id", default_value = "groupchat-adapter")]
    source_id: String,

    /// error, warn, info, debug or trace (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn")]
    loglevel: String,

    /// Also write a daily-rotating log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_CHAT_HOST)]
    chat_host: String,

    #[arg(long, default_value_t = DEFAULT_CHAT_PORT)]
    chat_port: u16,

    #[arg(long, default_value = DEFAULT_RESOURCE)]
    resource: String,

    /// Disable TLS certificate verification (development servers only)
    #[arg(long)]
    dangerous_insecure_tls: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AdapterConfig> {
        let mut xmpp = XmppConfig::new(self.user, self.pass, self.nick)?;
        xmpp.host = self.chat_host;
        xmpp.port = self.chat_port;
        xmpp.resource = self.resource;
        xmpp.insecure_tls = self.dangerous_insecure_tls;
        xmpp.validate()?;

        let bus = BusConfig::new(self.server, self.port, self.source_id)?;
        Ok(AdapterConfig::new(xmpp, bus))
    }
}

/// Install the stderr layer and, with `log_dir`, a non-blocking daily file layer.
/// The returned guard must live until exit so buffered lines get flushed.
fn init_logging(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let level: tracing::Level = match level.parse() {
        Ok(level) => level,
        Err(_) => bail!("invalid log level '{level}' (expected error, warn, info, debug or trace)"),
    };
    let directive = format!("groupchat_adapter={},warn", level.as_str().to_ascii_lowercase());
    let filter = || {
        if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(&directive)
        }
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory '{}'", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "groupchat-adapter.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("could not install the logger")?;

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.loglevel, cli.log_dir.as_deref())?;

    let config = cli.into_config()?;
    xmpp::init_crypto_provider();
    if config.xmpp.insecure_tls {
        warn!("TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
    }

    let bus_span = info_span!("bus", source = %config.bus.source_id);
    let mut bus = BusClient::connect(&config.bus, bus_span)
        .await
        .context("cannot reach the bus server")?;
    bus.engage().await.context("failed to engage with the bus server")?;
    info!(source = bus.source_id(), "Engaged with bus server");

    let (to_bus, bus_outbound) = mpsc::channel(CHANNEL_CAPACITY);
    let (bus_inbound, from_bus) = mpsc::channel(CHANNEL_CAPACITY);
    let bus_task = bus.run(bus_outbound, bus_inbound);

    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let xmpp_span = info_span!("xmpp", host = %config.xmpp.host, user = %config.xmpp.username);
    let reader_task = lifecycle::spawn_reader(lifecycle::Lifecycle::new(config.xmpp.clone(), xmpp_span), events_tx);

    let bridge = Bridge::new(&config.xmpp.nick, &config.bus.source_id, info_span!("bridge"));
    bridge.run(events_rx, from_bus, to_bus, config.keepalive_interval).await;

    reader_task.abort();
    bus_task.abort();
    info!("Adapter stopped");
    Ok(())
}
