//! bacscan CLI
//!
//! Runs one operation against a freshly started proxy and prints the
//! structured JSON response.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacscan::config::{BacscanConfig, LogFormat, LoggingConfig};
use bacscan::discovery::ScanParams;
use bacscan::properties::PropertyRef;
use bacscan::OrchestrationContext;

/// BACnet discovery and enumeration through a proxy engine
#[derive(Parser, Debug)]
#[command(name = "bacscan")]
#[command(about = "BACnet discovery and enumeration through a proxy engine", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local address for the proxy (auto-detected when omitted)
    #[arg(long, global = true)]
    address: Option<IpAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a subnet for devices
    Scan {
        /// Network in CIDR notation
        network: String,
        #[arg(long)]
        whois_timeout: Option<f64>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        low: Option<u32>,
        #[arg(long)]
        high: Option<u32>,
        /// Only broadcast Who-Is, skip the per-address sweep
        #[arg(long)]
        no_brute_force: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Upper bound on the whole scan, in seconds
        #[arg(long)]
        max_duration: Option<f64>,
        #[arg(long)]
        force_fresh: bool,
    },

    /// List a device's objects, one page at a time
    Objects {
        address: String,
        /// Device identifier, e.g. `device,1001`
        device: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 100)]
        page_size: u32,
        #[arg(long)]
        force_fresh: bool,
    },

    /// Read one property
    Read {
        address: String,
        object: String,
        property: String,
        #[arg(long)]
        index: Option<u32>,
    },

    /// Write one property. VALUE is parsed as JSON, falling back to a string.
    Write {
        address: String,
        object: String,
        property: String,
        value: String,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        index: Option<u32>,
    },

    /// Read all properties of a device
    Device { address: String, device: String },

    /// Broadcast a Who-Is
    WhoIs {
        #[arg(long)]
        low: Option<u32>,
        #[arg(long)]
        high: Option<u32>,
        #[arg(long)]
        destination: Option<String>,
    },

    /// Show devices remembered from earlier scans
    CachedDevices,
}

impl Command {
    fn needs_proxy(&self) -> bool {
        !matches!(self, Command::CachedDevices)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = BacscanConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Starting bacscan v{}", env!("CARGO_PKG_VERSION"));

    let ctx = OrchestrationContext::new(config)
        .await
        .context("Failed to open cache")?;

    let output = if args.command.needs_proxy() {
        let started = ctx.start_proxy(args.address).await;
        if started.is_done() {
            let output = run(&ctx, args.command).await;
            ctx.stop_proxy().await;
            output?
        } else {
            serde_json::to_value(&started)?
        }
    } else {
        run(&ctx, args.command).await?
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if output.get("status").and_then(Value::as_str) == Some("error") {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(ctx: &OrchestrationContext, command: Command) -> Result<Value> {
    let output = match command {
        Command::Scan {
            network,
            whois_timeout,
            port,
            low,
            high,
            no_brute_force,
            concurrency,
            max_duration,
            force_fresh,
        } => {
            let params = ScanParams {
                whois_timeout,
                port,
                low_limit: low,
                high_limit: high,
                enable_brute_force: no_brute_force.then_some(false),
                semaphore_limit: concurrency,
                max_duration,
                force_fresh,
            };
            serde_json::to_value(ctx.scan_subnet(&network, params).await)?
        }
        Command::Objects {
            address,
            device,
            page,
            page_size,
            force_fresh,
        } => serde_json::to_value(
            ctx.read_object_names(&address, &device, page, page_size, force_fresh)
                .await,
        )?,
        Command::Read {
            address,
            object,
            property,
            index,
        } => {
            let property = PropertyRef::new(&address, &object, &property).with_index(index);
            serde_json::to_value(ctx.read_property(property).await)?
        }
        Command::Write {
            address,
            object,
            property,
            value,
            priority,
            index,
        } => {
            let property = PropertyRef::new(&address, &object, &property).with_index(index);
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            serde_json::to_value(ctx.write_property(property, value, priority).await)?
        }
        Command::Device { address, device } => {
            serde_json::to_value(ctx.read_device_all(&address, &device).await)?
        }
        Command::WhoIs {
            low,
            high,
            destination,
        } => serde_json::to_value(ctx.who_is(low, high, destination.as_deref()).await)?,
        Command::CachedDevices => serde_json::to_value(ctx.cached_devices())?,
    };
    Ok(output)
}

/// Logs go to stderr so stdout carries only the JSON response
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
