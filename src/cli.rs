use std::path::PathBuf;
use clap::Parser;
use tracing::Dispatch;

/// Config file looked up beside the executable when `-c` is not given
pub const DEFAULT_CONFIG_FILE: &str = "Dispatcher.json";

#[derive(Parser)]
#[command(name = "file-dispatcher")]
#[command(version)]
#[command(about = "Copies newly created files from watched directories to their destinations")]
#[command(long_about = "File Dispatcher watches the source directories listed in its JSON config and copies every new file into the matching destination directory. It runs in a terminal or under a service manager.")]
pub struct Cli {
    /// Path to the JSON configuration
    #[arg(short = 'c', long = "config", value_name = "PATH", help = "Config json (defaults to Dispatcher.json beside the executable)")]
    pub config: Option<PathBuf>,

    /// What to do with the service
    #[arg(short = 'm', long = "mode", default_value = "", value_parser = parse_mode, help = "Mode: install, uninstall, run")]
    pub mode: ServiceMode,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Run the dispatcher (also selected by an empty mode)
    Run,
    /// Install a systemd unit for this executable
    Install,
    /// Remove the systemd unit
    Uninstall,
}

fn parse_mode(value: &str) -> Result<ServiceMode, String> {
    match value {
        "" | "run" => Ok(ServiceMode::Run),
        "install" => Ok(ServiceMode::Install),
        "uninstall" => Ok(ServiceMode::Uninstall),
        other => Err(format!("Unrecognized mode flag: {other}")),
    }
}

impl Cli {
    pub fn get_config_path(&self) -> Result<PathBuf, String> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }

        let executable = std::env::current_exe()
            .map_err(|err| format!("Cannot find the default config file: {err}"))?;
        let dir = executable
            .parent()
            .ok_or_else(|| "Cannot find the default config file".to_string())?;
        Ok(dir.join(DEFAULT_CONFIG_FILE))
    }

    /// Build the log subscriber.
    ///
    /// Under a service manager the journal adds timestamps and does not
    /// render colours, so both are left out.
    pub fn setup_logging(&self, under_service_manager: bool) -> Dispatch {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);

        if under_service_manager {
            Dispatch::new(builder.with_ansi(false).without_time().finish())
        } else {
            Dispatch::new(builder.finish())
        }
    }

    pub fn validate(&self) -> Result<PathBuf, String> {
        let path = self.get_config_path()?;

        match path.try_exists() {
            Ok(true) => Ok(path),
            Ok(false) => Err(format!("Config file {} does not exist", path.display())),
            Err(err) => Err(format!("Cannot check the existence of config file {}: {err}", path.display())),
        }
    }
}
