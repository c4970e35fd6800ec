//! Blufi CLI binary.
//!
//! BLE Wi-Fi provisioning from the command line.
//!
//! # Commands
//!
//! - `scan` - List nearby Blufi devices
//! - `provision` - Negotiate keys and send station credentials
//! - `status` - Show the device's Wi-Fi status
//! - `version` - Show the device's protocol version
//! - `wifi-scan` - List access points the device can see
//! - `events` - Print the event stream as JSON lines
//!
//! Without the `ble` feature only `--simulate` works.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use blufi::{
    sim::{SimHandle, SimulatedDevice, DEFAULT_ADDRESS},
    BlufiClient, Config, Event, VERSION,
};
use tokio::time;

#[derive(Parser)]
#[command(name = "blufi")]
#[command(version = VERSION)]
#[command(about = "Blufi - BLE Wi-Fi provisioning client", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/blufi/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Talk to an in-process simulated device instead of a radio
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby Blufi devices
    Scan {
        /// Scan duration in seconds (default: from config)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Negotiate keys and send station credentials
    Provision {
        /// Device address
        #[arg(short, long)]
        address: Option<String>,

        /// Network name
        #[arg(short, long)]
        ssid: String,

        /// Network passphrase (empty for open networks)
        #[arg(short, long, default_value = "")]
        password: String,
    },

    /// Show the device's Wi-Fi status
    Status {
        /// Device address
        #[arg(short, long)]
        address: Option<String>,

        /// Negotiate keys first
        #[arg(long)]
        secure: bool,
    },

    /// Show the device's protocol version
    Version {
        /// Device address
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List access points the device can see
    WifiScan {
        /// Device address
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Print the event stream as JSON lines
    Events {
        /// Connect to this device while listening
        #[arg(short, long)]
        address: Option<String>,

        /// Seconds to listen
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let scan_duration = config.scan.duration();
    let client = open_client(cli.simulate, config).await?;

    match cli.command {
        Commands::Scan { duration } => {
            let duration = duration.map_or(scan_duration, Duration::from_secs);
            cmd_scan(&client, duration, cli.json).await
        },
        Commands::Provision {
            address,
            ssid,
            password,
        } => {
            let address = resolve_address(address, cli.simulate)?;
            cmd_provision(&client, &address, &ssid, &password, cli.json).await
        },
        Commands::Status { address, secure } => {
            let address = resolve_address(address, cli.simulate)?;
            cmd_status(&client, &address, secure, cli.json).await
        },
        Commands::Version { address } => {
            let address = resolve_address(address, cli.simulate)?;
            cmd_version(&client, &address, cli.json).await
        },
        Commands::WifiScan { address } => {
            let address = resolve_address(address, cli.simulate)?;
            cmd_wifi_scan(&client, &address, cli.json).await
        },
        Commands::Events { address, duration } => {
            cmd_events(&client, address.as_deref(), Duration::from_secs(duration)).await
        },
    }
}

async fn open_client(simulate: bool, config: Config) -> anyhow::Result<BlufiClient> {
    if simulate {
        tracing::info!("Using simulated device at {}", DEFAULT_ADDRESS);
        return Ok(BlufiClient::simulated(
            SimHandle::new(SimulatedDevice::new()),
            config,
        )?);
    }

    #[cfg(feature = "ble")]
    {
        let transport = blufi::transport::BleTransport::new().await?;
        Ok(BlufiClient::new(transport, config)?)
    }

    #[cfg(not(feature = "ble"))]
    {
        let _ = config;
        anyhow::bail!("built without BLE support; rebuild with --features ble or pass --simulate")
    }
}

fn resolve_address(address: Option<String>, simulate: bool) -> anyhow::Result<String> {
    match address {
        Some(address) => Ok(address),
        None if simulate => Ok(DEFAULT_ADDRESS.to_string()),
        None => anyhow::bail!("--address is required; run 'blufi scan' to find devices"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_scan(client: &BlufiClient, duration: Duration, json: bool) -> anyhow::Result<()> {
    let mut events = client.events();
    client.scan().await?;

    let mut seen = HashSet::new();
    let deadline = time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Event::ScanResult { address, name, rssi } = &event {
                    if !seen.insert(address.clone()) {
                        continue;
                    }
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        let rssi = rssi.map_or_else(|| "?".to_string(), |r| r.to_string());
                        println!(
                            "{address}  {rssi:>4} dBm  {}",
                            name.as_deref().unwrap_or("(unnamed)")
                        );
                    }
                }
            },
        }
    }

    client.stop_scan().await?;
    if !json {
        eprintln!("{} device(s) found", seen.len());
    }
    Ok(())
}

async fn cmd_provision(
    client: &BlufiClient,
    address: &str,
    ssid: &str,
    password: &str,
    json: bool,
) -> anyhow::Result<()> {
    client.connect(address).await?;
    client
        .negotiate_security()
        .await
        .context("security negotiation failed, credentials not sent")?;

    let result = client.configure_sta(ssid, password).await;
    client.disconnect().await?;
    let result = result?;

    if json {
        print_json(&result)?;
    } else if result.success {
        println!("Device joined '{ssid}'");
    } else {
        println!(
            "Device failed to join '{ssid}' (reason {})",
            result.error_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_status(
    client: &BlufiClient,
    address: &str,
    secure: bool,
    json: bool,
) -> anyhow::Result<()> {
    client.connect(address).await?;
    if secure {
        client.negotiate_security().await?;
    }
    let status = client.device_status().await;
    client.disconnect().await?;
    let status = status?;

    if json {
        return print_json(&status);
    }
    println!("Mode:        {:?}", status.op_mode);
    println!(
        "Station:     {}",
        if status.is_sta_connected() {
            "connected"
        } else {
            "not connected"
        }
    );
    if let Some(ssid) = &status.sta_ssid {
        println!("SSID:        {ssid}");
    }
    if let Some(bssid) = &status.sta_bssid {
        println!("BSSID:       {bssid}");
    }
    if let Some(rssi) = status.rssi {
        println!("RSSI:        {rssi} dBm");
    }
    if let Some(reason) = status.conn_end_reason {
        println!("End reason:  {reason}");
    }
    println!("AP clients:  {}", status.softap_conn_count);
    Ok(())
}

async fn cmd_version(client: &BlufiClient, address: &str, json: bool) -> anyhow::Result<()> {
    client.connect(address).await?;
    let version = client.device_version().await;
    client.disconnect().await?;
    let version = version?;

    if json {
        print_json(&version)
    } else {
        println!("Blufi {version}");
        Ok(())
    }
}

async fn cmd_wifi_scan(client: &BlufiClient, address: &str, json: bool) -> anyhow::Result<()> {
    client.connect(address).await?;
    let mut entries = client.device_wifi_scan().await?;
    client.disconnect().await?;

    if json {
        return print_json(&entries);
    }
    entries.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    for entry in &entries {
        println!("{:>4} dBm  {}", entry.rssi, entry.ssid);
    }
    eprintln!("{} network(s)", entries.len());
    Ok(())
}

async fn cmd_events(
    client: &BlufiClient,
    address: Option<&str>,
    duration: Duration,
) -> anyhow::Result<()> {
    let mut events = client.events();
    if let Some(address) = address {
        client.connect(address).await?;
    } else {
        client.scan().await?;
    }

    let deadline = time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    if address.is_some() {
        client.disconnect().await?;
    } else {
        client.stop_scan().await?;
    }
    Ok(())
}
