//! Process-level hosting of the dispatcher service.
//!
//! `run` drives a [`DispatcherService`] until Ctrl-C or SIGTERM. `install`
//! and `uninstall` manage a systemd unit that starts the binary in run mode.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use crate::service::{DispatcherService, SERVICE_NAME};

/// Where systemd looks for administrator-installed units
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Whether the process was started by a service manager rather than a terminal
pub fn under_service_manager() -> bool {
    // systemd sets INVOCATION_ID for every unit it starts
    std::env::var_os("INVOCATION_ID").is_some()
}

/// Run the service until a stop is requested or the loop ends on its own
pub async fn run(mut service: DispatcherService) -> Result<()> {
    if under_service_manager() {
        tracing::info!("Running under service manager.");
    } else {
        tracing::info!("Running in terminal.");
    }

    let stop = CancellationToken::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.cancel())
        .context("Failed to install stop signal handler")?;

    service.on_start()?;

    tokio::select! {
        () = stop.cancelled() => {}
        result = service.join() => return result,
    }

    service.on_stop();
    service.join().await
}

pub fn unit_file_path(unit_dir: &Path) -> PathBuf {
    unit_dir.join(format!("{SERVICE_NAME}.service"))
}

/// Render the systemd unit that runs `executable` against `config_path`
pub fn render_unit(executable: &Path, config_path: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=File Dispatcher that copies files.\n\
         After=local-fs.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart=\"{}\" -c \"{}\" -m run\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        executable.display(),
        config_path.display(),
    )
}

/// Write the unit file for this executable; an existing unit is left alone
pub fn install(unit_dir: &Path, config_path: &Path) -> Result<PathBuf> {
    let executable = std::env::current_exe().context("Cannot locate the running executable")?;
    let config_path = config_path
        .canonicalize()
        .with_context(|| format!("Cannot resolve config path {}", config_path.display()))?;

    let unit_path = unit_file_path(unit_dir);
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&unit_path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            bail!("Service is already installed at {}", unit_path.display());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Cannot create unit file {}", unit_path.display()));
        }
    };

    file.write_all(render_unit(&executable, &config_path).as_bytes())
        .with_context(|| format!("Cannot write unit file {}", unit_path.display()))?;

    tracing::info!(unit = %unit_path.display(), "Service installed, enable it with `systemctl enable --now {SERVICE_NAME}`");
    Ok(unit_path)
}

/// Remove the unit file written by [`install`]
pub fn uninstall(unit_dir: &Path) -> Result<PathBuf> {
    let unit_path = unit_file_path(unit_dir);

    match fs::remove_file(&unit_path) {
        Ok(()) => {
            tracing::info!(unit = %unit_path.display(), "Service uninstalled");
            Ok(unit_path)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            bail!("Service is not installed at {}", unit_path.display())
        }
        Err(err) => Err(err).with_context(|| format!("Cannot remove unit file {}", unit_path.display())),
    }
}
