//! Kamstrup CLI - Command-line interface
//!
//! Polls the meter over the optical head for headless operation and cron jobs.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use kamstrup_core::cli::{print_exit_codes, CliResult, ExitCodes};
use kamstrup_core::config::{self, AppConfig, ConfigError, LoggingConfig};
use kamstrup_core::core::protocol::framing::{FrameAccumulator, END};
use kamstrup_core::core::protocol::kamstrup::{build_read_request, parse_read_response};
use kamstrup_core::core::transport::list_ports;
use kamstrup_core::{
    CatalogPreset, DecodeError, ErrorInjectionConfig, FanoutSink, MeterDriver, MeterLink,
    MetricsSink, PollConfig, Poller, PublishFormat, RegisterCatalog, RegisterId, SerialLink,
    SweepSummary, SystemClock, TransportError, VirtualMeter, WriterSink,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
    /// CSV format
    Csv,
}

impl From<OutputFormat> for PublishFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => PublishFormat::Text,
            OutputFormat::Json => PublishFormat::Json,
            OutputFormat::Csv => PublishFormat::Csv,
        }
    }
}

/// Kamstrup optical meter CLI
#[derive(Parser, Debug)]
#[command(
    name = "kamstrup-cli",
    version,
    about = "Poll Kamstrup energy meters through an optical read head",
    long_about = None
)]
struct Cli {
    /// Output format (defaults to the config's publish format)
    #[arg(short, long, value_enum, global = true)]
    format: Option<OutputFormat>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "KAMSTRUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Port and timing overrides on top of the config file
#[derive(Args, Debug, Default)]
struct PollArgs {
    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Register preset (single, bidirectional)
    #[arg(long)]
    preset: Option<CatalogPreset>,

    /// Failed attempts allowed per register
    #[arg(long)]
    retry_limit: Option<u32>,

    /// Response timeout (ms)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Delay between requests (ms)
    #[arg(long)]
    pacing_ms: Option<u64>,

    /// Time between sweep starts (ms)
    #[arg(long)]
    period_ms: Option<u64>,

    /// Let timeouts use the retry budget
    #[arg(long)]
    retry_on_timeout: bool,
}

impl PollArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(preset) = self.preset {
            config.registers = config::RegisterSource::Preset(preset);
        }
        if let Some(limit) = self.retry_limit {
            config.polling.retry_limit = limit;
        }
        if let Some(ms) = self.timeout_ms {
            config.polling.response_timeout_ms = ms;
        }
        if let Some(ms) = self.pacing_ms {
            config.polling.pacing_ms = ms;
        }
        if let Some(ms) = self.period_ms {
            config.polling.sweep_period_ms = ms;
        }
        if self.retry_on_timeout {
            config.polling.retry_on_timeout = true;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the configured register catalog
    Registers {
        /// Show a preset instead of the configured list
        #[arg(long)]
        preset: Option<CatalogPreset>,
    },

    /// Poll continuously and publish readings until Ctrl+C
    Poll {
        #[command(flatten)]
        args: PollArgs,

        /// Publish interval (ms)
        #[arg(long)]
        publish_ms: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Serve register gauges for Prometheus (e.g. 0.0.0.0:9184)
        #[arg(long)]
        metrics_listen: Option<SocketAddr>,
    },

    /// Run one sweep, print every register and exit
    Sweep {
        #[command(flatten)]
        args: PollArgs,

        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        max_secs: u64,
    },

    /// Print the request frame for a register as hex
    Encode {
        /// Register number (hex with 0x prefix, or decimal)
        register: RegisterId,
    },

    /// Decode a response frame given as hex
    Decode {
        /// Register the response should echo
        register: RegisterId,

        /// Response bytes, spaces allowed (e.g. "40 3f 10 ... 0d")
        data: String,
    },

    /// Sweep against the built-in virtual meter
    Simulate {
        /// Register preset
        #[arg(long, default_value = "single")]
        preset: CatalogPreset,

        /// Number of sweeps
        #[arg(short = 'n', long, default_value = "1")]
        sweeps: u32,

        /// Probability of a corrupted CRC
        #[arg(long, default_value = "0.0")]
        corrupt: f32,

        /// Probability of a dropped response
        #[arg(long = "drop", default_value = "0.0")]
        drop_rate: f32,

        /// Probability of noise ahead of the frame
        #[arg(long, default_value = "0.0")]
        garbage: f32,

        /// Probability of an unterminated junk stream
        #[arg(long, default_value = "0.0")]
        overflow: f32,

        /// RNG seed
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Failed attempts allowed per register
        #[arg(long, default_value = "3")]
        retry_limit: u32,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return CliResult::from(e).to_exit_code();
        }
    };

    let _guard = match init_logging(&cli, &config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to set up logging: {e:#}");
            return ExitCode::from(ExitCodes::ERROR);
        }
    };

    let result = match run(&cli, config).await {
        Ok(result) => result,
        Err(e) => error_result(&e),
    };

    if let Some(msg) = result.message() {
        if result.is_success() {
            if !cli.quiet {
                eprintln!("{msg}");
            }
        } else {
            eprintln!("Error: {msg}");
        }
    }
    result.to_exit_code()
}

/// Map an error chain onto an exit code
fn error_result(err: &anyhow::Error) -> CliResult {
    let msg = format!("{err:#}");
    let code = if let Some(e) = err.downcast_ref::<TransportError>() {
        match e {
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::InvalidSettings(_) => ExitCodes::CONFIG_ERROR,
            _ => ExitCodes::CONNECTION_FAILED,
        }
    } else if err.downcast_ref::<ConfigError>().is_some() {
        ExitCodes::CONFIG_ERROR
    } else if err.downcast_ref::<DecodeError>().is_some() {
        ExitCodes::PROTOCOL_ERROR
    } else if err.downcast_ref::<hex::FromHexError>().is_some() {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::ERROR
    };
    CliResult::error(code, msg)
}

fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    // `config init` must work even when the current file is missing or broken
    if matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Init { .. }
        }
    ) {
        return Ok(AppConfig::default());
    }
    match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(false);

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kamstrup.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

async fn run(cli: &Cli, mut config: AppConfig) -> anyhow::Result<CliResult> {
    let format: PublishFormat = cli.format.map_or(config.publish.format, Into::into);

    match &cli.command {
        Commands::ListPorts { detailed } => show_ports(cli, format, *detailed),
        Commands::Registers { preset } => {
            let catalog = match preset {
                Some(preset) => RegisterCatalog::preset(*preset),
                None => config.catalog()?,
            };
            show_registers(&catalog, format)
        }
        Commands::Poll {
            args,
            publish_ms,
            duration,
            metrics_listen,
        } => {
            args.apply(&mut config);
            if let Some(ms) = publish_ms {
                config.publish.interval_ms = *ms;
            }
            if metrics_listen.is_some() {
                config.publish.metrics_listen = *metrics_listen;
            }
            config.validate()?;
            poll(&config, format, duration.map(Duration::from_secs)).await
        }
        Commands::Sweep { args, max_secs } => {
            args.apply(&mut config);
            config.validate()?;
            let catalog = config.catalog()?;
            info!("Opening {}", config.serial.describe());
            let link = SerialLink::open(config.serial.clone())?;
            let limit = Duration::from_secs(*max_secs);
            sweep(link, catalog, &config, format, limit).await
        }
        Commands::Encode { register } => encode(*register, format),
        Commands::Decode { register, data } => decode(*register, data, format),
        Commands::Simulate {
            preset,
            sweeps,
            corrupt,
            drop_rate,
            garbage,
            overflow,
            seed,
            retry_limit,
        } => {
            let catalog = RegisterCatalog::preset(*preset);
            let mut meter = VirtualMeter::with_catalog(&catalog);
            meter.inject_errors(ErrorInjectionConfig {
                enabled: true,
                corruption_probability: *corrupt,
                drop_probability: *drop_rate,
                garbage_probability: *garbage,
                overflow_probability: *overflow,
                seed: *seed,
            });
            let polling = PollConfig {
                retry_limit: *retry_limit,
                response_timeout_ms: 250,
                pacing_ms: 0,
                sweep_period_ms: 1,
                tick_ms: 1,
                retry_on_timeout: false,
            };
            let mut last = CliResult::success();
            let poller = Poller::new(meter, SystemClock::new(), catalog, polling);
            let mut driver = MeterDriver::new(poller, u64::MAX);
            for n in 1..=*sweeps {
                info!("Simulated sweep {}/{}", n, sweeps);
                let mut sink = WriterSink::new(io::stdout(), format);
                last = match driver.sweep_once(&mut sink, Duration::from_secs(60)).await? {
                    Some(summary) => sweep_result(&summary),
                    None => CliResult::timeout("Simulated sweep did not finish"),
                };
            }
            if !cli.quiet {
                print_stats(&driver.summary(), format);
            }
            Ok(last)
        }
        Commands::Config { action } => handle_config(cli, &config, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

fn show_ports(cli: &Cli, format: PublishFormat, detailed: bool) -> anyhow::Result<CliResult> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    match format {
        PublishFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        PublishFormat::Csv => {
            println!("name,type");
            for port in &ports {
                println!("{},{:?}", port.port_name, port.port_type);
            }
        }
        PublishFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {} [{:?}]", port.port_name, port.port_type);
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(CliResult::success())
}

fn show_registers(catalog: &RegisterCatalog, format: PublishFormat) -> anyhow::Result<CliResult> {
    match format {
        PublishFormat::Json => {
            println!("{}", serde_json::to_string_pretty(catalog.entries())?);
        }
        PublishFormat::Csv => {
            println!("index,register,label,unit");
            for (i, d) in catalog.iter().enumerate() {
                println!("{},{},{},{}", i, d.id, d.label, d.unit.as_deref().unwrap_or(""));
            }
        }
        PublishFormat::Text => {
            println!("{:>3}  {:<8} {:<16} {}", "#", "Register", "Label", "Unit");
            println!("{:-<40}", "");
            for (i, d) in catalog.iter().enumerate() {
                println!(
                    "{:>3}  {:<8} {:<16} {}",
                    i,
                    d.id.to_string(),
                    d.label,
                    d.unit.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(CliResult::success())
}

async fn poll(
    config: &AppConfig,
    format: PublishFormat,
    duration: Option<Duration>,
) -> anyhow::Result<CliResult> {
    let catalog = config.catalog()?;
    info!("Opening {}", config.serial.describe());
    let link = SerialLink::open(config.serial.clone())?;

    let poller = Poller::new(link, SystemClock::new(), catalog, config.polling.clone());
    let mut driver = MeterDriver::new(poller, config.publish.interval_ms);
    let mut sink = FanoutSink::new();
    sink.push(WriterSink::new(io::stdout(), format));
    if let Some(addr) = config.publish.metrics_listen {
        install_exporter(addr)?;
        sink.push(MetricsSink::new());
    }

    let shutdown = async {
        match duration {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(limit) => {}
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Could not listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    let summary = driver.run(&mut sink, shutdown).await;
    let stats = driver.poller().link().stats();
    info!(
        "Stopped after {} sweeps ({} bytes sent, {} received, {} discarded)",
        summary.stats.sweeps_completed, stats.bytes_sent, stats.bytes_received, stats.bytes_discarded
    );
    if summary.publish_failures > 0 {
        warn!("{} publish rounds failed", summary.publish_failures);
    }
    Ok(CliResult::success())
}

#[cfg(feature = "prometheus")]
fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Could not serve metrics on {addr}: {e}"))?;
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    anyhow::bail!("Cannot serve metrics on {addr}: built without the `prometheus` feature")
}

async fn sweep<L: MeterLink>(
    link: L,
    catalog: RegisterCatalog,
    config: &AppConfig,
    format: PublishFormat,
    limit: Duration,
) -> anyhow::Result<CliResult> {
    let poller = Poller::new(link, SystemClock::new(), catalog, config.polling.clone());
    let mut driver = MeterDriver::new(poller, config.publish.interval_ms);
    let mut sink = WriterSink::new(io::stdout(), format);

    match driver.sweep_once(&mut sink, limit).await? {
        Some(summary) => Ok(sweep_result(&summary)),
        None => Ok(CliResult::timeout(format!(
            "Sweep did not finish within {} s",
            limit.as_secs()
        ))),
    }
}

fn sweep_result(summary: &SweepSummary) -> CliResult {
    if summary.is_complete() {
        CliResult::success_with_message(format!("{}/{} registers read", summary.valid, summary.total))
    } else {
        CliResult::validation_failed(format!(
            "only {}/{} registers read",
            summary.valid, summary.total
        ))
    }
}

fn print_stats(summary: &SweepSummary, format: PublishFormat) {
    let s = &summary.stats;
    match format {
        PublishFormat::Json => match serde_json::to_string(summary) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => warn!("Could not serialize stats: {}", e),
        },
        _ => {
            eprintln!(
                "sweeps={} requests={} values={} decode_failures={} overflows={} timeouts={} skipped={}",
                s.sweeps_completed,
                s.requests_sent,
                s.values_stored,
                s.decode_failures,
                s.overflows,
                s.timeouts,
                s.registers_skipped
            );
        }
    }
}

fn encode(register: RegisterId, format: PublishFormat) -> anyhow::Result<CliResult> {
    let frame = build_read_request(register);
    match format {
        PublishFormat::Json => println!(
            "{}",
            serde_json::json!({ "register": register.0, "frame": hex::encode(&frame) })
        ),
        PublishFormat::Csv => println!("register,frame\n{},{}", register, hex::encode(&frame)),
        PublishFormat::Text => println!("{}", hex::encode(&frame)),
    }
    Ok(CliResult::success())
}

fn decode(register: RegisterId, data: &str, format: PublishFormat) -> anyhow::Result<CliResult> {
    let mut bytes = hex::decode(data.replace([' ', ':'], ""))?;
    if bytes.last() != Some(&END) {
        bytes.push(END);
    }

    let mut acc = FrameAccumulator::new();
    let mut raw = None;
    for byte in bytes {
        if let Some(frame) = acc.push(byte)? {
            raw = Some(frame);
            break;
        }
    }
    let Some(raw) = raw else {
        anyhow::bail!("No frame found in input");
    };

    let response = parse_read_response(&raw, register)?;
    let value = response.value();
    match format {
        PublishFormat::Json => println!(
            "{}",
            serde_json::json!({
                "register": response.register.0,
                "unit": response.unit.0,
                "unit_name": response.unit.name(),
                "mantissa": response.mantissa,
                "exponent": response.exponent(),
                "value": value,
            })
        ),
        PublishFormat::Csv => println!(
            "register,unit,mantissa,exponent,value\n{},{},{},{},{}",
            response.register,
            response.unit,
            response.mantissa,
            response.exponent(),
            value
        ),
        PublishFormat::Text => println!("{} = {} {}", response.register, value, response.unit),
    }
    Ok(CliResult::success())
}

fn handle_config(cli: &Cli, config: &AppConfig, action: &ConfigAction) -> anyhow::Result<CliResult> {
    match action {
        ConfigAction::Init { force } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => config::config_path().ok_or(ConfigError::NoConfigDir)?,
            };
            if path.exists() && !force {
                return Ok(CliResult::error(
                    ExitCodes::CONFIG_ERROR,
                    format!("{} exists, use --force to overwrite", path.display()),
                ));
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            AppConfig::default().save_to(&path)?;
            Ok(CliResult::success_with_message(format!("Wrote {}", path.display())))
        }
        ConfigAction::Show => {
            match cli.format {
                Some(OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(config)?),
                _ => print!("{}", config.to_toml()?),
            }
            Ok(CliResult::success())
        }
        ConfigAction::Path => {
            match &cli.config {
                Some(path) => println!("{}", path.display()),
                None => match config::config_path() {
                    Some(path) => println!("{}", path.display()),
                    None => return Err(ConfigError::NoConfigDir.into()),
                },
            }
            Ok(CliResult::success())
        }
    }
}
