//! The event dispatch loop.
//!
//! One task owns the [`WatchRegistrar`] and consumes filesystem events,
//! watcher errors and the stop signal, handling one event at a time in
//! arrival order. New directories are fed back into the registrar; new files
//! are matched against the configured mappings and copied after a settle
//! delay. Nothing that happens to a single event stops the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio_util::sync::CancellationToken;
use crate::config::DispatcherConfig;
use crate::copier::{copy_into, CopyOutcome};
use crate::events::{DispatchOutcome, LoopState};
use crate::matcher::{match_mapping, normalize_path};
use crate::watcher::{WatchRegistrar, WatchStreams};

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    reporter: Option<UnboundedSender<DispatchOutcome>>,
    state_tx: watch::Sender<LoopState>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Starting);
        Self {
            config: Arc::new(config),
            reporter: None,
            state_tx,
        }
    }

    /// Receive one [`DispatchOutcome`] per processed path
    pub fn with_reporter(mut self, reporter: UnboundedSender<DispatchOutcome>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Seed the watch set and run until stopped.
    ///
    /// Returns an error only if the watcher cannot be created or a configured
    /// source cannot be registered. The watch subscription is released when
    /// this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (mut registrar, streams) = match self.start() {
            Ok(started) => started,
            Err(err) => {
                tracing::error!("Dispatch loop failed to start: {err:#}");
                self.state_tx.send_replace(LoopState::Stopped);
                return Err(err);
            }
        };

        self.state_tx.send_replace(LoopState::Running);
        tracing::info!(watched = registrar.len(), "Start to listen on specified sources");

        self.serve(&mut registrar, streams, shutdown).await
    }

    /// Consume events until stopped or until either stream closes.
    ///
    /// Watcher errors are logged and do not end the loop. Publishes
    /// `Stopped` before returning.
    async fn serve(
        &self,
        registrar: &mut WatchRegistrar,
        mut streams: WatchStreams,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                event = streams.events.recv() => match event {
                    Some(event) => self.handle_event(registrar, event).await,
                    None => {
                        tracing::warn!("Watcher event stream closed");
                        break;
                    }
                },
                err = streams.errors.recv() => match err {
                    Some(err) => tracing::error!(%err, "File watcher error"),
                    None => {
                        tracing::warn!("Watcher error stream closed");
                        break;
                    }
                },
                () = shutdown.cancelled() => {
                    tracing::info!("Stop requested");
                    break;
                }
            }
        }

        self.state_tx.send_replace(LoopState::Stopped);
        tracing::info!("Dispatch loop stopped");
        Ok(())
    }

    fn start(&self) -> Result<(WatchRegistrar, WatchStreams)> {
        let (mut registrar, streams) = WatchRegistrar::new(self.config.recursive)?;

        for mapping in &self.config.threads {
            registrar
                .register_root(&mapping.source)
                .with_context(|| format!("Error on adding source path {}", mapping.source.display()))?;
        }

        Ok((registrar, streams))
    }

    async fn handle_event(&self, registrar: &mut WatchRegistrar, event: Event) {
        let paths = created_paths(&event);
        if paths.is_empty() {
            tracing::trace!(kind = ?event.kind, paths = ?event.paths, "Ignoring event");
            return;
        }

        for path in paths {
            let outcome = self.process_created(registrar, path).await;
            tracing::debug!(?outcome, "Processed created path");
            if let Some(reporter) = &self.reporter {
                let _ = reporter.send(outcome);
            }
        }
    }

    async fn process_created(&self, registrar: &mut WatchRegistrar, path: &Path) -> DispatchOutcome {
        let path = normalize_path(path);

        // The entry may already be gone by the time the event is handled
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "Error on checking whether it is a dir");
                return DispatchOutcome::Failed {
                    path,
                    reason: err.to_string(),
                };
            }
        };

        if metadata.is_dir() {
            if !registrar.is_recursive() {
                tracing::debug!(path = %path.display(), "New folder ignored, recursive watching is off");
                return DispatchOutcome::DirectoryIgnored(path);
            }

            tracing::info!(path = %path.display(), "New folder created, adding it to the watcher");
            return match registrar.extend(&path) {
                Ok(()) => DispatchOutcome::DirectoryWatched(path),
                Err(err) => {
                    tracing::error!(path = %path.display(), "Failed to add newly created folder: {err:#}");
                    DispatchOutcome::Failed {
                        path,
                        reason: format!("{err:#}"),
                    }
                }
            };
        }

        tracing::info!(path = %path.display(), "New file created");
        let Some(index) = match_mapping(&path, &self.config.threads) else {
            tracing::warn!(path = %path.display(), "New file fails to match any source paths specified");
            return DispatchOutcome::Unmatched(path);
        };
        let destination = &self.config.threads[index].destination;

        // Give the writer a chance to finish before reading
        tokio::time::sleep(self.config.settle_delay()).await;

        match copy_into(&path, destination).await {
            Ok(CopyOutcome::Copied { target, bytes }) => {
                tracing::info!(from = %path.display(), to = %destination.display(), "Success to copy file");
                DispatchOutcome::Copied { source: path, target, bytes }
            }
            Ok(CopyOutcome::Skipped { target }) => DispatchOutcome::Skipped { source: path, target },
            Err(err) => {
                tracing::error!(from = %path.display(), to = %destination.display(), %err, "Failed to copy file");
                DispatchOutcome::Failed {
                    path,
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Paths that newly appeared in a watched directory.
///
/// Besides plain creation this covers entries renamed or moved in from
/// elsewhere, which is how writers that stage to a temp file deliver. For a
/// rename reported with both ends, only the destination counts.
pub fn created_paths(event: &Event) -> &[PathBuf] {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.as_slice(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.get(1) {
            Some(to) => std::slice::from_ref(to),
            None => &[],
        },
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use notify::event::{CreateKind, DataChange};
    use tokio::sync::mpsc;
    use crate::config::ThreadMapping;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        source: std::path::PathBuf,
        destination: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let source = temp.path().join("in");
        let destination = temp.path().join("out");
        std::fs::create_dir(&source).unwrap();
        std::fs::create_dir(&destination).unwrap();
        Fixture {
            source: source.canonicalize().unwrap(),
            destination: destination.canonicalize().unwrap(),
            _temp: temp,
        }
    }

    fn dispatcher(fx: &Fixture, recursive: bool) -> Dispatcher {
        let mut config = DispatcherConfig::new(vec![ThreadMapping::new(&fx.source, &fx.destination)]);
        config.recursive = recursive;
        config.settle_delay_ms = 10;
        Dispatcher::new(config)
    }

    #[tokio::test]
    async fn test_created_file_is_copied() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        let file = fx.source.join("report.csv");
        std::fs::write(&file, "a,b,c\n").unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &file).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Copied {
                source: file,
                target: fx.destination.join("report.csv"),
                bytes: 6,
            }
        );
        assert_eq!(std::fs::read_to_string(fx.destination.join("report.csv")).unwrap(), "a,b,c\n");
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_skipped() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        let file = fx.source.join("report.csv");
        std::fs::write(&file, "a,b,c\n").unwrap();

        dispatcher.process_created(&mut registrar, &file).await;
        let outcome = dispatcher.process_created(&mut registrar, &file).await;

        assert!(matches!(outcome, DispatchOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_new_directory_is_registered() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        let sub = fx.source.join("sub");
        std::fs::create_dir(&sub).unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &sub).await;

        assert_eq!(outcome, DispatchOutcome::DirectoryWatched(sub.clone()));
        assert!(registrar.is_watched(&sub));
    }

    #[tokio::test]
    async fn test_new_directory_ignored_when_flat() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, false);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        let sub = fx.source.join("sub");
        std::fs::create_dir(&sub).unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &sub).await;

        assert_eq!(outcome, DispatchOutcome::DirectoryIgnored(sub.clone()));
        assert!(!registrar.is_watched(&sub));
    }

    #[tokio::test]
    async fn test_vanished_path_is_a_failure() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &fx.source.join("gone.tmp")).await;

        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn test_nested_file_is_unmatched() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        std::fs::create_dir(fx.source.join("sub")).unwrap();
        let file = fx.source.join("sub/deep.txt");
        std::fs::write(&file, "x").unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &file).await;

        assert_eq!(outcome, DispatchOutcome::Unmatched(file));
        assert_eq!(std::fs::read_dir(&fx.destination).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_destination_is_a_failure() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let (mut registrar, _streams) = dispatcher.start().unwrap();
        std::fs::remove_dir(&fx.destination).unwrap();
        let file = fx.source.join("report.csv");
        std::fs::write(&file, "x").unwrap();

        let outcome = dispatcher.process_created(&mut registrar, &file).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { ref reason, .. } if reason.contains("does not exist")));
        assert!(!fx.destination.exists());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_source() {
        let fx = fixture();
        let mut config = DispatcherConfig::new(vec![ThreadMapping::new(fx.source.join("missing"), &fx.destination)]);
        config.settle_delay_ms = 10;
        let dispatcher = Dispatcher::new(config);
        let state = dispatcher.state();

        let result = dispatcher.run(CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_loop() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let mut state = dispatcher.state();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(dispatcher.run(shutdown.clone()));
        state.wait_for(|s| *s == LoopState::Running).await.unwrap();
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }

    #[test]
    fn test_created_paths_by_kind() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/in/a".into());
        assert_eq!(created_paths(&created), [PathBuf::from("/in/a")]);

        let moved_in = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path("/in/b".into());
        assert_eq!(created_paths(&moved_in), [PathBuf::from("/in/b")]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/in/c.tmp".into())
            .add_path("/in/c".into());
        assert_eq!(created_paths(&renamed), [PathBuf::from("/in/c")]);

        let moved_out = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path("/in/d".into());
        assert!(created_paths(&moved_out).is_empty());

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path("/in/e".into());
        assert!(created_paths(&written).is_empty());

        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::File)).add_path("/in/f".into());
        assert!(created_paths(&removed).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_error_does_not_stop_loop() {
        let fx = fixture();
        let (reporter, mut outcomes) = mpsc::unbounded_channel();
        let dispatcher = dispatcher(&fx, true).with_reporter(reporter);
        let (mut registrar, _real_streams) = dispatcher.start().unwrap();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let file = fx.source.join("after-error.txt");
        std::fs::write(&file, "still here").unwrap();
        error_tx.send(notify::Error::generic("event queue overflow")).unwrap();
        event_tx
            .send(Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()))
            .unwrap();

        let serving = dispatcher.serve(&mut registrar, WatchStreams { events, errors }, shutdown.clone());
        let observe = async {
            let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
                .await
                .unwrap()
                .unwrap();
            shutdown.cancel();
            outcome
        };
        let (result, outcome) = tokio::join!(serving, observe);

        assert!(result.is_ok());
        assert!(matches!(outcome, DispatchOutcome::Copied { ref source, .. } if source == &file));
        assert_eq!(std::fs::read_to_string(fx.destination.join("after-error.txt")).unwrap(), "still here");
        drop(error_tx);
    }

    #[tokio::test]
    async fn test_closed_event_stream_stops_loop() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let state = dispatcher.state();
        let (mut registrar, _real_streams) = dispatcher.start().unwrap();
        let (event_tx, events) = mpsc::unbounded_channel::<Event>();
        let (_error_tx, errors) = mpsc::unbounded_channel::<notify::Error>();
        drop(event_tx);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.serve(&mut registrar, WatchStreams { events, errors }, CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_closed_error_stream_stops_loop() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, true);
        let state = dispatcher.state();
        let (mut registrar, _real_streams) = dispatcher.start().unwrap();
        let (_event_tx, events) = mpsc::unbounded_channel::<Event>();
        let (error_tx, errors) = mpsc::unbounded_channel::<notify::Error>();
        drop(error_tx);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.serve(&mut registrar, WatchStreams { events, errors }, CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }
}
