use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sortbin::detector::{FrameSource, TriggerDetector};
use sortbin::discovery::{ControllerDirectory, SystemPortScanner};
use sortbin::telemetry::FileTelemetrySink;
use sortbin::{HttpClassifier, Orchestrator, SortbinConfig};

#[derive(Parser, Debug)]
#[command(name = "sortbin")]
#[command(about = "Control loop for a camera-triggered waste-sorting appliance")]
#[command(version)]
#[command(long_about = "Drives a waste-sorting appliance: discovers the stepper and \
mechanism controllers over serial, watches the deposit area with a camera, sends each \
deposited item to a classification service, and routes it into the matching compartment.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sortbin.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the appliance")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting sortbin v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match SortbinConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let scanner = SystemPortScanner::new(&config.serial);
    let directory = ControllerDirectory::new(Box::new(scanner), config.serial.clone());
    let detector = TriggerDetector::new(frame_source(&config), config.detector.clone());
    let classifier = HttpClassifier::new(&config.classifier);
    let telemetry = FileTelemetrySink::new(&config.telemetry);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(
        config,
        directory,
        detector,
        Box::new(classifier),
        Box::new(telemetry),
        cancel,
    );

    match orchestrator.run().await {
        Ok(()) => {
            info!("sortbin exited cleanly");
            Ok(())
        }
        Err(e) => {
            error!("System error during execution: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(feature = "camera-v4l2")]
fn frame_source(config: &SortbinConfig) -> Box<dyn FrameSource> {
    Box::new(sortbin::detector::V4l2Source::new(config.detector.camera_index))
}

#[cfg(not(feature = "camera-v4l2"))]
fn frame_source(_config: &SortbinConfig) -> Box<dyn FrameSource> {
    tracing::warn!("Built without the camera-v4l2 feature; using a synthetic frame source");
    Box::new(sortbin::StubFrameSource::new(Vec::new()))
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sortbin={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Sortbin Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[serial]
# Serial line speed shared by both controllers
baud_rate = 9600
# Settle time after opening a port, covering the controller reset
settle_delay_ms = 1500
# Response window for the identity handshake
handshake_timeout_ms = 1000
# Response window for ordinary actuation commands
command_timeout_ms = 1000
# Response window for the fill-level sensor poll
sensor_timeout_ms = 5000
# Where the discovered role-to-port mapping is persisted
port_map_path = "controller_ports.json"

[detector]
# Camera device index (e.g., 0 for /dev/video0)
camera_index = 0
# Fraction of changed pixels required to consider a trigger
change_threshold = 0.01
# Per-pixel grayscale difference cutoff
delta_threshold = 25
# Minimum contiguous changed region to confirm a trigger
min_region_area = 500.0
# Gaussian blur sigma applied during frame normalization
blur_sigma = 3.5
# Delay between detection polls
poll_interval_ms = 3000

[classifier]
# Classification service endpoint
endpoint = "http://127.0.0.1:8090/classify"
# Bearer token for the classification service; empty disables auth
api_key = ""
# End-to-end request timeout in seconds
timeout_secs = 30

[telemetry]
# Telemetry log file, newest record first
path = "sort_log.txt"
# Appliance identifier written with every record
bin_code = "BIN001"
# Human-readable appliance location
location = "Unset"

[orchestrator]
# Recoverable failures tolerated before a full session restart
max_retries = 3
# Delay before retrying after a recoverable failure
retry_delay_ms = 2000
# Delay between tearing a session down and rediscovering
restart_delay_ms = 5000
# Quiet period after a completed cycle before polling resumes
cycle_cooldown_ms = 3000
# Fill level above which all compartments are flushed
fill_threshold = 10
# Keep retrying discovery instead of exiting when no hardware answers
wait_for_hardware = false
"#;

    println!("{}", default_config);
}
