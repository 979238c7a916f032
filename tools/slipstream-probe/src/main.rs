// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! slipstream-probe - inspect streaming servers from the command line.
//!
//! `discover` broadcasts on the LAN and lists every server that answers;
//! `query` performs the handshake exchange against one URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use slipstream::client::{Client, DiscoveryCtrl, ServerInfo};

/// Probe slipstream servers on the network
#[derive(Parser, Debug)]
#[command(name = "slipstream-probe")]
#[command(version)]
#[command(about = "Discover and query slipstream streaming servers")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Device identifier sent in the handshake
    #[arg(long, default_value = "slipstream-probe")]
    device_id: String,

    /// Wait this many seconds for answers
    #[arg(long, default_value = "10")]
    timeout_sec: u64,

    /// Largest datagram to accept
    #[arg(long, default_value = "65507")]
    datagram_size: usize,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast discovery and list every responding server
    Discover {
        /// Discovery port to broadcast on
        #[arg(short, long, default_value = "1235")]
        port: u16,
    },
    /// Query one server directly (udp://host:port or tcp://host:port)
    Query {
        /// Server URL
        url: String,
    },
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })?;

    let mut client = Client::new(&args.device_id);
    client.set_timeout(Duration::from_secs(args.timeout_sec))?;
    client.set_max_datagram_size(args.datagram_size);

    match &args.command {
        Command::Discover { port } => {
            eprintln!(
                "{} Broadcasting discovery on port {} ({}s window)...",
                ">>>".green().bold(),
                port,
                args.timeout_sec
            );
            let mut seen = 0usize;
            let mut on_server = |info: &ServerInfo| {
                seen += 1;
                if matches!(args.format, OutputFormat::Pretty) {
                    print_server(info, seen);
                }
                if stop.load(Ordering::SeqCst) {
                    DiscoveryCtrl::Stop
                } else {
                    DiscoveryCtrl::Continue
                }
            };
            let servers = client.enumerate_servers(*port, Some(&mut on_server))?;
            if matches!(args.format, OutputFormat::Json) {
                println!("{}", servers_json(&servers)?);
            } else {
                eprintln!(
                    "{} {} server(s) found",
                    "<<<".green().bold(),
                    servers.len()
                );
            }
        }
        Command::Query { url } => {
            eprintln!("{} Querying {}...", ">>>".green().bold(), url);
            let info = client.query_server_info(url)?;
            match args.format {
                OutputFormat::Pretty => print_server(&info, 1),
                OutputFormat::Json => {
                    println!("{}", servers_json(std::slice::from_ref(&info))?)
                }
            }
        }
    }
    Ok(())
}

fn print_server(info: &ServerInfo, index: usize) {
    let d = &info.descriptor;
    println!("{} {}", format!("[{}]", index).cyan().bold(), d.server_name.bold());
    println!("    url        {}", info.url);
    println!(
        "    protocol   v{} (min v{})",
        d.protocol_version, d.protocol_min_version
    );
    println!(
        "    datagram   {} bytes (max {})",
        d.datagram_size, d.max_datagram_size
    );
    println!("    transports {}", d.transports().join(", "));
    if !d.os_name.is_empty() {
        println!("    os         {}", d.os_name);
    }
    if !d.options.is_empty() {
        println!(
            "    options    {}",
            serde_json::to_string(&d.options).unwrap_or_default()
        );
    }
}

fn servers_json(servers: &[ServerInfo]) -> Result<String, Box<dyn std::error::Error>> {
    let entries: Vec<serde_json::Value> = servers
        .iter()
        .map(|info| {
            serde_json::json!({
                "name": info.descriptor.server_name,
                "url": info.url,
                "protocolVersion": info.descriptor.protocol_version,
                "datagramSize": info.descriptor.datagram_size,
                "transports": info.descriptor.transports(),
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}
