use clap::Parser;
use anyhow::Result;

use file_dispatcher::{
    cli::{Cli, ServiceMode},
    host,
    DispatcherConfig, DispatcherService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let under_service_manager = host::under_service_manager();
    let log = cli.setup_logging(under_service_manager);
    if let Err(err) = tracing::dispatcher::set_global_default(log.clone()) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    let config_path = match cli.validate() {
        Ok(path) => path,
        Err(err) => {
            tracing::error!("{}", err);
            std::process::exit(1);
        }
    };

    let config = match DispatcherConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Loading config file error: {:#}", err);
            std::process::exit(1);
        }
    };
    tracing::info!(
        config = %config_path.display(),
        threads = config.threads.len(),
        recursive = config.recursive,
        "Configuration loaded"
    );

    let unit_dir = std::path::Path::new(host::SYSTEMD_UNIT_DIR);
    let result = match cli.mode {
        ServiceMode::Install => host::install(unit_dir, &config_path).map(|_| ()),
        ServiceMode::Uninstall => host::uninstall(unit_dir).map(|_| ()),
        ServiceMode::Run => host::run(DispatcherService::new(config, log)).await,
    };

    if let Err(err) = result {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
