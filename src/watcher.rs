use std::collections::HashSet;
use std::path::{Path, PathBuf};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use ignore::WalkBuilder;
use anyhow::{Result, Context};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use crate::matcher::normalize_path;

/// Receiving ends of the notify subscription.
///
/// Events and watcher-internal errors arrive on separate channels; both close
/// when the owning [`WatchRegistrar`] is dropped.
pub struct WatchStreams {
    pub events: UnboundedReceiver<Event>,
    pub errors: UnboundedReceiver<notify::Error>,
}

/// Owns the notify watcher and the set of directories it is subscribed to.
///
/// Every directory is watched non-recursively; recursion is done here so
/// that each subscription is visible in the watch set. The set only grows.
pub struct WatchRegistrar {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
    recursive: bool,
}

impl WatchRegistrar {
    pub fn new(recursive: bool) -> Result<(Self, WatchStreams)> {
        // The callback runs on notify's event-loop thread, which also serves
        // `watch()` calls made from the dispatch loop. It must never block.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let (error_tx, error_rx) = mpsc::unbounded_channel::<notify::Error>();

        // Create the notify watcher
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            // Send failures mean the loop is gone; nothing left to deliver to
            match result {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(err) => {
                    let _ = error_tx.send(err);
                }
            }
        })
        .context("Failed to create file system watcher")?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
                recursive,
            },
            WatchStreams {
                events: event_rx,
                errors: error_rx,
            },
        ))
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Subscribe to a configured source, walking its tree in recursive mode
    pub fn register_root<P: AsRef<Path>>(&mut self, root: P) -> Result<()> {
        if self.recursive {
            self.register_tree(root)
        } else {
            self.watch_dir(root.as_ref())
        }
    }

    /// Subscribe to `root` and every directory beneath it.
    ///
    /// Fails on the first directory that cannot be read or watched.
    pub fn register_tree<P: AsRef<Path>>(&mut self, root: P) -> Result<()> {
        let root = root.as_ref();

        for result in WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .build() {

            let entry = result
                .with_context(|| format!("Failed to walk directory tree {}", root.display()))?;

            if entry.file_type().map_or(false, |ft| ft.is_dir()) {
                self.watch_dir(entry.path())?;
            }
        }

        Ok(())
    }

    /// Subscribe to a directory that appeared at runtime.
    ///
    /// Only the directory itself is added: it was just created, so anything
    /// inside it will be reported by later events.
    pub fn extend<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        self.watch_dir(dir.as_ref())
    }

    pub fn is_watched<P: AsRef<Path>>(&self, path: P) -> bool {
        self.watched.contains(&normalize_path(path))
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.watched.iter().map(PathBuf::as_path)
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        let dir = normalize_path(dir);
        if self.watched.contains(&dir) {
            return Ok(());
        }

        self.watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory {}", dir.display()))?;

        tracing::debug!(path = %dir.display(), "Watching directory");
        self.watched.insert(dir);
        Ok(())
    }
}
