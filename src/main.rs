//! routing-core: diagnostic CLI for the routing decision engine
//!
//! Loads a configuration, builds the route table and engine, and either
//! evaluates one flow or runs the coordinator against the background service.
//!
//! # Usage
//!
//! ```bash
//! # Route one flow and print the decision as JSON
//! routing-core -c config.json --host game.example.com --port 443
//!
//! # Sniff the host from captured first bytes
//! routing-core -c config.json --ip 203.0.113.7 --port 443 --payload-file hello.bin
//!
//! # Validate the configuration only
//! routing-core -c config.json --check
//!
//! # Run the coordinator and log snapshots until interrupted
//! ROUTING_CORE_SERVICE_SOCKET=/run/routing.sock routing-core -c config.json --serve
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use routing_core::config::{apply_env_overrides, load_config_with_env, Config};
use routing_core::rules::{FlowDescriptor, FlowProtocol, NetworkType};

/// Command-line arguments
#[derive(Debug, Default)]
struct Args {
    /// Configuration file path (defaults when absent)
    config_path: Option<PathBuf>,
    /// Generate default configuration at the config path
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Run the coordinator until interrupted
    serve: bool,
    host: Option<String>,
    ip: Option<String>,
    port: Option<String>,
    protocol: Option<String>,
    package: Option<String>,
    network: Option<String>,
    payload_file: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self::default();

        while let Some(arg) = args.next() {
            let slot = match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = args.next().map(PathBuf::from);
                    continue;
                }
                "-g" | "--generate-config" => {
                    parsed.generate_config = true;
                    continue;
                }
                "--check" => {
                    parsed.check_config = true;
                    continue;
                }
                "--serve" => {
                    parsed.serve = true;
                    continue;
                }
                "--payload-file" => {
                    parsed.payload_file = args.next().map(PathBuf::from);
                    continue;
                }
                "--host" => &mut parsed.host,
                "--ip" => &mut parsed.ip,
                "--port" => &mut parsed.port,
                "--protocol" => &mut parsed.protocol,
                "--package" => &mut parsed.package,
                "--network" => &mut parsed.network,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("routing-core v{}", routing_core::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            };
            *slot = args.next();
        }

        parsed
    }

    /// Build the flow descriptor from the flow options
    fn flow(&self) -> Result<FlowDescriptor> {
        let port: u16 = match &self.port {
            Some(p) => p.parse().with_context(|| format!("invalid port: {p}"))?,
            None => 443,
        };
        let protocol = match &self.protocol {
            Some(p) => FlowProtocol::parse(p)?,
            None => FlowProtocol::Tcp,
        };

        let mut flow = FlowDescriptor::new(port, protocol);
        if let Some(host) = &self.host {
            flow = flow.with_host(host.clone());
        }
        if let Some(ip) = &self.ip {
            let ip: IpAddr = ip.parse().with_context(|| format!("invalid IP address: {ip}"))?;
            flow = flow.with_ip(ip);
        }
        if let Some(package) = &self.package {
            flow = flow.with_package(package.clone());
        }
        if let Some(network) = &self.network {
            flow = flow.with_network(NetworkType::parse(network)?);
        }
        if let Some(path) = &self.payload_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read payload file {}", path.display()))?;
            flow = flow.with_sniff_bytes(bytes);
        }

        if flow.host.is_none() && flow.ip.is_none() && flow.sniff_bytes.is_none() {
            bail!("a flow needs at least one of --host, --ip or --payload-file");
        }
        Ok(flow)
    }
}

fn print_help() {
    println!(
        r#"routing-core v{}

Routing decision engine for a proxy client.

USAGE:
    routing-core [OPTIONS]

OPTIONS:
    -c, --config <PATH>      Configuration file path [default: built-in defaults]
    -g, --generate-config    Generate default configuration at --config and exit
    --check                  Check configuration and exit
    --serve                  Run the coordinator and log snapshots until interrupted
    -h, --help               Print help information
    -v, --version            Print version information

FLOW:
    --host <NAME>            Destination host
    --ip <ADDR>              Destination IP address
    --port <PORT>            Destination port [default: 443]
    --protocol <PROTO>       tcp, udp, http or tls [default: tcp]
    --package <ID>           Originating package id
    --network <TYPE>         wifi, cellular, ethernet, metered or unknown
    --payload-file <PATH>    Raw first bytes of the flow to sniff

ENVIRONMENT:
    ROUTING_CORE_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    ROUTING_CORE_GEOIP_PATH       Override GeoIP database path
    ROUTING_CORE_CACHE_TTL_SECS   Override decision cache TTL
    ROUTING_CORE_SERVICE_SOCKET   Override background service socket
"#,
        routing_core::VERSION
    );
}

/// Initialize logging
///
/// Logs go to stderr so stdout carries only the decision.
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tokio=warn", level.as_str().to_lowercase())));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    match (config.log.format.as_str(), config.log.timestamps) {
        ("json", _) => subscriber.json().init(),
        ("pretty", _) => subscriber.pretty().init(),
        (_, true) => subscriber.init(),
        (_, false) => subscriber.without_time().init(),
    }
}

fn load(args: &Args) -> Result<Config> {
    let config = match &args.config_path {
        Some(path) => load_config_with_env(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => apply_env_overrides(Config::default_config(), |name| std::env::var(name).ok())?,
    };
    Ok(config)
}

/// Run the coordinator until SIGINT/SIGTERM
async fn serve(config: &Config) -> Result<()> {
    let coordinator = config.build_coordinator()?;
    let mut snapshots = coordinator.subscribe();
    coordinator.initialize().await;

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        #[cfg(unix)]
        let term = sigterm.recv();
        #[cfg(not(unix))]
        let term = std::future::pending::<Option<()>>();

        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => info!(
                    version = snapshot.table_version(),
                    status = ?snapshot.status,
                    routes = snapshot.active_routes.len(),
                    error = snapshot.error.as_deref().unwrap_or("-"),
                    "route snapshot"
                ),
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = term => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    coordinator.cleanup().await;
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let Some(path) = &args.config_path else {
            bail!("--generate-config needs --config <PATH>");
        };
        routing_core::config::create_default_config(path)?;
        println!("Generated default configuration at {:?}", path);
        return Ok(());
    }

    let config = load(&args)?;

    if args.check_config {
        let table = config.build_table()?;
        println!(
            "Configuration is valid: {} rules, fallback chain {:?}",
            table.len(),
            table.fallback_chain()
        );
        return Ok(());
    }

    init_logging(&config);
    info!("routing-core v{}", routing_core::VERSION);

    if args.serve {
        return serve(&config).await;
    }

    let flow = args.flow()?;
    let table = config.build_table()?;
    let engine = config.build_engine();
    let decision = engine.lookup(&flow, &table);

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
