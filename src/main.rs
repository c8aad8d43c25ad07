use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use orderguard::config::{AppConfig, LoggingConfig};
use orderguard::identity::{resolve_client_ip, ClientIp, RequestHeaders};
use orderguard::ratelimit::memory::DEFAULT_ORDER_TYPE;
use orderguard::ratelimit::{
    Clock, FixedClock, InMemoryOrderStore, OrderLimiter, StaticOrderTypes, SystemClock, Window,
};

/// Per-client order rate limiting
#[derive(Debug, Parser)]
#[command(name = "orderguard", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON file of orders to load into the in-memory store
    #[arg(long, global = true)]
    orders: Option<PathBuf>,

    /// Recognized order type; may be repeated
    #[arg(long = "order-type", value_name = "TYPE", global = true)]
    order_types: Vec<String>,

    /// Evaluate at this instant (RFC 3339) instead of the current time
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decide whether a client may place an order now
    Evaluate(ClientArgs),
    /// Show the current and next window
    Window,
    /// Print the settings description as JSON
    Describe(ClientArgs),
    /// Render one message (checkout_error, customer_notice, order_button)
    Message { kind: String },
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Client address, bypassing header resolution
    #[arg(long)]
    ip: Option<String>,

    /// Request header as "Name: value"; may be repeated
    #[arg(long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Address of the connecting socket
    #[arg(long)]
    remote_addr: Option<String>,
}

impl ClientArgs {
    fn resolve(&self) -> anyhow::Result<Option<ClientIp>> {
        if let Some(ip) = &self.ip {
            return Ok(Some(ClientIp {
                header: String::new(),
                address: ip.clone(),
            }));
        }

        if self.headers.is_empty() && self.remote_addr.is_none() {
            return Ok(None);
        }

        let mut request = RequestHeaders::new();
        for header in &self.headers {
            let Some((name, value)) = header.split_once(':') else {
                bail!("Invalid header {:?}, expected \"Name: value\"", header);
            };
            request.insert(name.trim(), value.trim());
        }
        if let Some(addr) = &self.remote_addr {
            request = request.with_remote_addr(addr.clone());
        }

        let client = resolve_client_ip(&request);
        debug!(header = %client.header, address = %client.address, "Resolved client address");
        Ok(Some(client))
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn window_json(window: &Window) -> serde_json::Value {
    json!({
        "start": window.start.to_rfc3339(),
        "end": window.end.to_rfc3339(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = match &cli.orders {
        Some(path) => InMemoryOrderStore::from_json_file(path)
            .with_context(|| format!("Failed to load orders from {}", path.display()))?,
        None => InMemoryOrderStore::new(),
    };

    let order_types = if cli.order_types.is_empty() {
        vec![DEFAULT_ORDER_TYPE.to_string()]
    } else {
        cli.order_types.clone()
    };

    let clock: Arc<dyn Clock> = match cli.now {
        Some(now) => Arc::new(FixedClock::new(now)),
        None => Arc::new(SystemClock),
    };

    let limiter = OrderLimiter::builder(Arc::new(store), Arc::new(StaticOrderTypes::new(order_types)))
        .settings(config.limiter.clone())
        .locale(config.store.clone())
        .clock(clock)
        .build()?;

    info!(
        enabled = limiter.is_enabled(),
        limit = limiter.get_limit(),
        interval = %limiter.interval(),
        "Order limiter initialized"
    );

    match cli.command {
        Command::Evaluate(client) => {
            let Some(client) = client.resolve()? else {
                bail!("evaluate needs --ip, --header or --remote-addr");
            };
            let decision = limiter.evaluate(&client.address).await;
            let output = json!({
                "client": &client,
                "result": &decision,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);

            if !decision.is_allowed() {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Window => {
            let output = json!({
                "interval": limiter.interval().key(),
                "current": window_json(&limiter.window()),
                "next": window_json(&limiter.next_window()),
                "seconds_until_end": limiter.seconds_until_window_end(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Describe(client) => {
            let description = limiter.describe_settings_ui(client.resolve()?).await;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
        Command::Message { kind } => {
            println!("{}", limiter.render_message(&kind));
        }
    }

    Ok(ExitCode::SUCCESS)
}
