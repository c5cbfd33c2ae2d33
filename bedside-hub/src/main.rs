use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bedside_ble::{BtleplugLink, DeviceSession, GattLink, SimulatedBed};
use bedside_hub::{App, Config, MemoryPin, RelayController};
use embedded_hal::digital::OutputPin;

#[derive(clap::Parser)]
#[command(name = "bedside-hub")]
#[command(about = "HTTP controller for a BLE adjustable bed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a default config.json to $BEDSIDE_HOME
    InitConfig,
    /// Run the server
    Run {
        /// Address to listen on, e.g. 0.0.0.0:8000
        #[arg(short, long)]
        listen: Option<String>,
        /// Config file, defaults to $BEDSIDE_HOME/config.json
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Drive an in-memory bed and relay instead of the real ones
        #[arg(long)]
        simulate: bool,
    },
    /// Scan for nearby BLE devices to find the bed's address
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Bluetooth adapter, e.g. hci0
        #[arg(short, long)]
        adapter: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli: Cli = clap::Parser::parse();
    let bedside_home = std::env::var("BEDSIDE_HOME").unwrap_or_else(|_| {
        dirs::home_dir()
            .expect("Could not determine home directory")
            .join(".bedside")
            .to_string_lossy()
            .to_string()
    });
    std::fs::create_dir_all(&bedside_home).unwrap();

    match cli.command {
        Commands::InitConfig => {
            let path = bedside_hub::config_path(&bedside_home);
            if let Err(e) = Config::write_default(&path) {
                eprintln!("{e}");
                std::process::exit(1);
            }
            println!("Created config at {}", path.display());
        }
        Commands::Run {
            listen,
            config,
            simulate,
        } => {
            let path = config.unwrap_or_else(|| bedside_hub::config_path(&bedside_home));
            let (mut config, missing) = match Config::load(&path) {
                Ok(Some(config)) => (config, None),
                Ok(None) => (Config::default(), Some(path)),
                Err(e) => {
                    eprintln!("Failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            if let Some(listen) = listen {
                config.listen = listen;
            }
            run(config, missing, simulate).await;
        }
        Commands::Scan { duration, adapter } => {
            scan(adapter.as_deref(), Duration::from_secs(duration)).await;
        }
    }
}

/// `missing` is the config file that wasn't found, if any
async fn run(config: Config, missing: Option<PathBuf>, simulate: bool) {
    let _logging = match bedside_hub::logging::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e}");
            std::process::exit(1);
        }
    };
    if let Some(path) = missing {
        tracing::warn!("{} not found, using defaults", path.display());
    }

    let (identity, codec) = match (config.identity(), config.codec()) {
        (Ok(identity), Ok(codec)) => (identity, codec),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    if simulate {
        tracing::info!("simulating the bed, no Bluetooth or GPIO is used");
        let relay = config
            .gpio
            .pin
            .map(|_| RelayController::new(MemoryPin::default()));
        let session = DeviceSession::new(SimulatedBed::new(), identity, codec, config.session());
        serve(&config, App::new(session, relay)).await;
        return;
    }

    let link = match BtleplugLink::new(config.io_timeout()).await {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("Bluetooth unavailable: {e}");
            std::process::exit(1);
        }
    };
    #[cfg(target_os = "linux")]
    let relay = match config.gpio.pin {
        Some(pin) => match bedside_hub::gpio::open_bcm(pin) {
            Ok(pin) => Some(RelayController::new(pin)),
            Err(e) => {
                tracing::warn!("GPIO light disabled: {e}");
                None
            }
        },
        None => None,
    };
    #[cfg(not(target_os = "linux"))]
    let relay: Option<RelayController<MemoryPin>> = {
        if config.gpio.pin.is_some() {
            tracing::warn!("GPIO light disabled: no GPIO on this platform");
        }
        None
    };
    let session = DeviceSession::new(link, identity, codec, config.session());
    serve(&config, App::new(session, relay)).await;
}

async fn serve<L, P>(config: &Config, app: App<L, P>)
where
    L: GattLink + 'static,
    P: OutputPin + Send + 'static,
{
    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    let app = Arc::new(app);
    tracing::info!(
        "controlling bed {} ({})",
        app.session.identity().address,
        config.bed.model
    );
    let monitor = app.session.spawn_idle_monitor();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    if let Err(e) = bedside_hub::http::run_server(listener, app.clone(), shutdown).await {
        tracing::error!("server failed: {e}");
    }

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    app.shutdown().await;
}

async fn scan(adapter: Option<&str>, duration: Duration) {
    println!("Scanning for BLE devices ({} seconds)...", duration.as_secs());
    let devices = match bedside_ble::scan(adapter, duration).await {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("Scan failed: {e}");
            std::process::exit(1);
        }
    };

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_bed { " [BED]" } else { "" };
        println!("  {} ({}) RSSI: {rssi}{marker}", device.name, device.address);
    }
}
