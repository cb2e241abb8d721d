use anyhow::{bail, Context, Result};
use bonjour_core::config::LogFormat;
use bonjour_core::{AppConfig, BroadcastConfig, DiscoveryEvent, DriverKind, LoggingConfig};
use bonjour_discovery::{is_valid_service_type, Bonjour, Driver, MdnsDriver, MemoryDriver};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bonjour - DNS-SD service discovery and advertisement
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BONJOUR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the discovery driver (mdns or memory)
    #[arg(short, long)]
    driver: Option<DriverKind>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether a string is a valid DNS-SD service type
    Check {
        /// Service type, e.g. "_http._tcp"
        service_type: String,
    },

    /// Browse for services until Ctrl-C
    Browse {
        /// Service type, e.g. "_http._tcp"
        service_type: String,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Advertise a service until Ctrl-C
    Advertise {
        /// Service type, e.g. "_http._tcp"
        service_type: String,

        /// Instance name
        #[arg(short, long, default_value = bonjour_core::types::DEFAULT_BROADCAST_NAME)]
        name: String,

        /// Port the service listens on
        #[arg(short, long, default_value_t = bonjour_core::types::DEFAULT_BROADCAST_PORT)]
        port: u16,

        /// TXT record, repeatable
        #[arg(long = "txt", value_name = "KEY=VALUE", value_parser = parse_txt)]
        txt: Vec<(String, String)>,
    },
}

fn parse_txt(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse command line arguments
    let args = Args::parse();

    if let Command::Check { service_type } = &args.command {
        return Ok(check(service_type));
    }

    // Load configuration, then apply command line overrides
    let mut config = AppConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load config file: {:?}", path),
        None => "Failed to load configuration from environment".to_string(),
    })?;
    if let Some(driver) = args.driver {
        config.discovery.driver = driver;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;
    info!(driver = %config.discovery.driver, "Starting bonjour");

    match config.discovery.driver {
        DriverKind::Mdns => {
            run(Bonjour::new(MdnsDriver::new(), config.discovery), args.command).await
        }
        DriverKind::Memory => {
            run(Bonjour::new(MemoryDriver::new(), config.discovery), args.command).await
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = logging.parse_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    // Logs go to stderr so browse output on stdout stays clean
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

fn check(service_type: &str) -> ExitCode {
    if is_valid_service_type(service_type) {
        println!("{service_type}: valid");
        ExitCode::SUCCESS
    } else {
        println!("{service_type}: not a valid DNS-SD service type");
        ExitCode::FAILURE
    }
}

async fn run<D: Driver>(bonjour: Bonjour<D>, command: Command) -> Result<ExitCode> {
    let context = CancellationToken::new();

    let result = match command {
        Command::Check { service_type } => Ok(check(&service_type)),
        Command::Browse { service_type, json } => {
            browse(&bonjour, &service_type, json, &context).await
        }
        Command::Advertise {
            service_type,
            name,
            port,
            txt,
        } => {
            let mut broadcast = BroadcastConfig::new(service_type);
            broadcast.name = name;
            broadcast.port = port;
            broadcast.txt_records.extend(txt);
            advertise(&bonjour, broadcast, &context).await
        }
    };

    context.cancel();
    bonjour.shutdown().await;
    info!("Stopped");
    result
}

async fn browse<D: Driver>(
    bonjour: &Bonjour<D>,
    service_type: &str,
    json: bool,
    context: &CancellationToken,
) -> Result<ExitCode> {
    let mut events = bonjour
        .start_discovery(service_type, context)
        .with_context(|| format!("Cannot browse for {service_type}"))?;
    info!(service_type, "Browsing, press Ctrl-C to stop");

    loop {
        tokio::select! {
            item = events.next() => match item {
                Some(Ok(event)) => print_event(&event, json)?,
                Some(Err(e)) => bail!(e),
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, stopping discovery...");
                break;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &DiscoveryEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        DiscoveryEvent::Added(service) => {
            println!("+ {service}");
            for (key, value) in service.txt_records() {
                println!("    {key}={value}");
            }
        }
        DiscoveryEvent::Removed(service) => {
            println!("- {} ({})", service.name(), service.service_type())
        }
    }
    Ok(())
}

async fn advertise<D: Driver>(
    bonjour: &Bonjour<D>,
    config: BroadcastConfig,
    context: &CancellationToken,
) -> Result<ExitCode> {
    let broadcast = bonjour
        .start_broadcast(config, context)
        .await
        .context("Failed to advertise service")?;

    let advertised = broadcast.config();
    info!(
        name = %advertised.name,
        service_type = %advertised.service_type,
        port = advertised.port,
        "Advertising, press Ctrl-C to stop"
    );

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, withdrawing service...");

    broadcast.stop();
    Ok(ExitCode::SUCCESS)
}
