use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};
use crate::config::DispatcherConfig;
use crate::dispatch::Dispatcher;
use crate::events::{DispatchOutcome, LoopState};

/// Name used for the service unit and in log output
pub const SERVICE_NAME: &str = "FileDispatcher";

/// The entry points a service host drives.
///
/// `on_start` spawns the dispatch loop and returns at once; `on_stop` asks
/// it to finish. The loop logs through the `Dispatch` given to `new`.
pub struct DispatcherService {
    config: DispatcherConfig,
    log: Dispatch,
    reporter: Option<UnboundedSender<DispatchOutcome>>,
    shutdown: CancellationToken,
    state: Option<watch::Receiver<LoopState>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl DispatcherService {
    pub fn new(config: DispatcherConfig, log: Dispatch) -> Self {
        Self {
            config,
            log,
            reporter: None,
            shutdown: CancellationToken::new(),
            state: None,
            task: None,
        }
    }

    pub fn with_reporter(mut self, reporter: UnboundedSender<DispatchOutcome>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Spawn the dispatch loop on the current tokio runtime
    pub fn on_start(&mut self) -> Result<()> {
        if self.state.is_some() {
            bail!("{SERVICE_NAME} has already been started");
        }

        let mut dispatcher = Dispatcher::new(self.config.clone());
        if let Some(reporter) = &self.reporter {
            dispatcher = dispatcher.with_reporter(reporter.clone());
        }
        self.state = Some(dispatcher.state());

        let span = tracing::info_span!("dispatcher", service = SERVICE_NAME);
        let run = dispatcher
            .run(self.shutdown.clone())
            .instrument(span)
            .with_subscriber(self.log.clone());
        self.task = Some(tokio::spawn(run));

        tracing::dispatcher::with_default(&self.log, || {
            tracing::info!(threads = self.config.threads.len(), "Service started");
        });
        Ok(())
    }

    /// Signal the loop to stop; does not wait for it
    pub fn on_stop(&self) {
        tracing::dispatcher::with_default(&self.log, || {
            tracing::info!("Service shutting down ...");
        });
        self.shutdown.cancel();
    }

    pub fn state(&self) -> LoopState {
        self.state
            .as_ref()
            .map_or(LoopState::Starting, |state| *state.borrow())
    }

    /// Wait until the watch set is seeded.
    ///
    /// Fails if the service was never started or the loop stopped before
    /// reaching `Running`.
    pub async fn wait_until_running(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            bail!("{SERVICE_NAME} has not been started");
        };

        let reached = *state
            .wait_for(|state| *state != LoopState::Starting)
            .await
            .context("Dispatch loop went away during startup")?;

        if reached != LoopState::Running {
            bail!("Dispatch loop stopped during startup");
        }
        Ok(())
    }

    /// Wait for the loop task to finish and return its result.
    ///
    /// Safe to use in `select!`: the task handle is kept until it completes.
    pub async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let result = task.await;
        self.task = None;
        result.context("Dispatch loop task failed")?
    }
}

impl Drop for DispatcherService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
