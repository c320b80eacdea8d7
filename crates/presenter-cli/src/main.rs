//! presenter CLI
//!
//! Configuration check and device diagnostics for the presenter device core.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use presenter_config::{ActionConfig, Config};
use presenter_daemon::device::{InterfaceKind, SupportedDevices};
use presenter_daemon::input_mapper::mappings_from_config;

#[derive(Parser, Debug)]
#[command(name = "presenter")]
#[command(about = "Presenter device core tool")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/presenter/config.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file
    Validate,

    /// List supported devices and their sub-devices
    Devices,
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate => cmd_validate(&config_path),
        Commands::Devices => cmd_devices(&config_path),
    }
}

fn describe_action(action: &ActionConfig) -> String {
    match action {
        ActionConfig::KeySequence(keys) => format!("key-sequence {}", keys.join(" ")),
        ActionConfig::LeftClick => "left-click".to_string(),
        ActionConfig::ToggleSpotlight => "toggle-spotlight".to_string(),
        ActionConfig::CyclePresets => "cycle-presets".to_string(),
        ActionConfig::Vibrate { length, intensity } => {
            format!("vibrate length={} intensity={}", length, intensity)
        }
        ActionConfig::PointerSpeed(speed) => format!("pointer-speed {}", speed),
    }
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = presenter_config::parse_config(config_path)?;
    println!("Configuration is valid!");
    println!("  Log level: {}", config.global.log_level.as_filter());
    println!("  Virtual device: {}", config.global.virtual_device);
    println!("  Sequence interval: {}ms", config.global.sequence_interval_ms);
    println!("  Spot timeout: {}ms", config.global.spot_timeout_ms);

    println!("  Additional supported devices: {}", config.supported_devices.len());
    for device in &config.supported_devices {
        println!(
            "    - {:04x}:{:04x} {}",
            device.vendor,
            device.product,
            device.name.as_deref().unwrap_or("")
        );
    }

    println!("  Mappings: {}", config.mappings.len());
    for mapping in &config.mappings {
        let steps: Vec<String> = mapping
            .sequence
            .iter()
            .map(|step| {
                step.events
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        println!("    - {} -> {}", steps.join(" "), describe_action(&mapping.action));
    }

    let resolved = mappings_from_config(&config.mappings).len();
    if resolved < config.mappings.len() {
        println!(
            "  Warning: {} mapping(s) use keys or combos the daemon cannot resolve",
            config.mappings.len() - resolved
        );
    }
    Ok(())
}

fn cmd_devices(config_path: &Path) -> miette::Result<()> {
    let config = if config_path.exists() {
        presenter_config::parse_config(config_path)?
    } else {
        Config::default()
    };
    let supported = SupportedDevices::with_additional(&config.supported_devices);
    let result = presenter_daemon::scan(&supported);

    if result.devices.is_empty() {
        println!("No supported devices found.");
    } else {
        println!("Supported devices:\n");
    }
    for device in &result.devices {
        println!("  {} [{}]", device.name, device.identity.vendor_product());
        println!("    Physical: {}", device.identity.phys);
        println!("    Bus: {}", device.bus);
        for sub in &device.sub_devices {
            let kind = match sub.kind {
                InterfaceKind::RawEvent => "event",
                InterfaceKind::RawProtocol => "hidraw",
            };
            println!(
                "    - {} ({}){}  readable={} writable={}",
                sub.devnode.display(),
                kind,
                if sub.supports_relative_motion {
                    " relative-motion"
                } else {
                    ""
                },
                sub.readable,
                sub.writable
            );
        }
        println!();
    }

    println!(
        "Readable sub-devices: {}, writable sub-devices: {}",
        result.readable_count, result.writable_count
    );

    if !result.errors.is_empty() {
        println!("\nErrors:");
        for error in &result.errors {
            println!("  {}", error);
        }
    }
    Ok(())
}
