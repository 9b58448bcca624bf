//! gea2 - Command-line client for GEA2 appliance buses
//!
//! Binds a bus through a configured transport and runs one command against
//! a destination device.

mod commands;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use gea2_bus::{ApplianceBus, Config, ProfileRegistry, TransportRegistry};
use gea2_protocol::{Address, DynamicSerializer, Endian, Erd, ValueKind};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gea2")]
#[command(about = "Talk to GEA2 appliances through a bus bridge")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "GEA2_CONFIG")]
    config: Option<PathBuf>,

    /// Source address of this client
    #[arg(short, long, value_parser = commands::parse_address)]
    address: Option<Address>,

    /// Transport name
    #[arg(short, long)]
    transport: Option<String>,

    /// Bridge socket address (tcp transport)
    #[arg(short, long)]
    bridge: Option<SocketAddr>,

    /// Destination device address
    #[arg(short, long, default_value = "0xC0", value_parser = commands::parse_address)]
    dest: Address,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How ERD values are encoded.
#[derive(Args, Clone, Copy)]
struct ValueFormat {
    /// Value kind (uint8, uint16, ..., int64, ascii, hex, raw)
    #[arg(short, long, default_value = "raw")]
    kind: ValueKind,

    /// Encode multi-byte integers big-endian
    #[arg(long)]
    big_endian: bool,
}

impl ValueFormat {
    fn serializer(&self) -> DynamicSerializer {
        let endian = if self.big_endian {
            Endian::Big
        } else {
            Endian::Little
        };
        DynamicSerializer::new(self.kind, endian)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read one or more ERDs
    Read {
        /// ERD identifiers (decimal or 0x hex)
        #[arg(required = true, value_parser = commands::parse_erd)]
        erds: Vec<Erd>,

        #[command(flatten)]
        format: ValueFormat,
    },

    /// Write an ERD
    Write {
        /// ERD identifier
        #[arg(value_parser = commands::parse_erd)]
        erd: Erd,

        /// Value, parsed according to --kind
        value: String,

        #[command(flatten)]
        format: ValueFormat,
    },

    /// Subscribe to ERDs and print publications until interrupted
    Subscribe {
        /// ERD identifiers
        #[arg(required = true, value_parser = commands::parse_erd)]
        erds: Vec<Erd>,

        #[command(flatten)]
        format: ValueFormat,
    },

    /// Publish an ERD value
    Publish {
        /// ERD identifier
        #[arg(value_parser = commands::parse_erd)]
        erd: Erd,

        /// Value, parsed according to --kind
        value: String,

        #[command(flatten)]
        format: ValueFormat,
    },

    /// Send a raw command and print the reply
    Send {
        /// Command (16-bit commands use the extended form)
        #[arg(value_parser = commands::parse_command)]
        command: u16,

        /// Payload as hex
        data: Option<String>,

        /// Reply timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print every inbound message until interrupted
    Listen {
        /// Output JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Broadcast a version query and print the announcements
    Discover {
        /// How long to collect announcements
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
    },
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    config.apply_env_overrides();

    if let Some(address) = cli.address {
        config.bus.source_address = address;
    }
    if let Some(ref transport) = cli.transport {
        config.transport.kind = transport.clone();
    }
    if let Some(bridge) = cli.bridge {
        config.transport.address = bridge;
    }
    // Discovery only runs from the discover command, after it is listening.
    config.appliance.discover = false;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Invalid configuration".red(), e);
            std::process::exit(1);
        }
    };

    let bus = match gea2_bus::bind(&config, &TransportRegistry::default(), &ProfileRegistry::new())
        .await
    {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("{}: {}", "Bind failed".red(), e);
            std::process::exit(1);
        }
    };

    let dest = cli.dest;
    match cli.command {
        Commands::Subscribe { erds, format } => subscribe(&bus, dest, erds, format).await?,
        Commands::Listen { json } => listen(&bus, json).await,
        Commands::Discover { wait_ms } => discover(&bus, wait_ms).await?,
        cmd => match commands::execute(&bus, dest, cmd).await {
            Ok(output) => {
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

async fn subscribe(
    bus: &ApplianceBus,
    dest: Address,
    erds: Vec<Erd>,
    format: ValueFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let serializer = Arc::new(format.serializer());
    let mut listeners = Vec::with_capacity(erds.len());

    for erd in erds {
        let object = bus.create_erd(dest, erd, serializer.clone());
        let subscribed = object
            .subscribe(move |value| println!("{}", commands::format_value(erd, value)))
            .await;

        match subscribed {
            Ok(listener) => {
                eprintln!("{} {}", "Subscribed to".green(), format!("{:#06x}", erd).cyan());
                listeners.push(listener);
            }
            Err(e) => eprintln!("{} {:#06x}: {}", "Subscribe failed for".red(), erd, e),
        }
    }

    if listeners.is_empty() {
        std::process::exit(1);
    }

    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
    tokio::signal::ctrl_c().await?;
    eprintln!("\n{}", "Stopping...".dimmed());
    Ok(())
}

async fn listen(bus: &ApplianceBus, json: bool) {
    // Every inbound message, version traffic included.
    let mut messages = bus.erd().messages();
    eprintln!("{}", "Listening, press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            message = messages.recv() => {
                match message {
                    Ok(message) => println!("{}", commands::format_message(&message, json)),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} messages", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => {
                        eprintln!("{}", "Bus closed".red());
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }
}

async fn discover(bus: &ApplianceBus, wait_ms: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut versions = bus.versions();
    bus.discover()?;

    let deadline = tokio::time::sleep(Duration::from_millis(wait_ms));
    tokio::pin!(deadline);

    let mut seen = BTreeSet::new();
    loop {
        tokio::select! {
            announcement = versions.recv() => {
                match announcement {
                    Ok(announcement) => {
                        if seen.insert(announcement.source) {
                            println!("{}", commands::format_announcement(&announcement));
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} announcements", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = &mut deadline => break,
        }
    }

    if seen.is_empty() {
        eprintln!("{}", "No appliances answered".yellow());
    }
    Ok(())
}
