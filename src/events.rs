use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Lifecycle of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
}

/// What the dispatch loop did with one created path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// A new directory was added to the watch set
    DirectoryWatched(PathBuf),
    /// A new directory was seen while recursive watching is off
    DirectoryIgnored(PathBuf),
    /// The file was copied into its mapping's destination
    Copied { source: PathBuf, target: PathBuf, bytes: u64 },
    /// The destination already had a file of that name
    Skipped { source: PathBuf, target: PathBuf },
    /// No mapping owns the file
    Unmatched(PathBuf),
    /// The event was dropped after an error
    Failed { path: PathBuf, reason: String },
}

impl DispatchOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            DispatchOutcome::DirectoryWatched(path)
            | DispatchOutcome::DirectoryIgnored(path)
            | DispatchOutcome::Unmatched(path) => path,
            DispatchOutcome::Copied { source, .. } | DispatchOutcome::Skipped { source, .. } => source,
            DispatchOutcome::Failed { path, .. } => path,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_path() {
        let copied = DispatchOutcome::Copied {
            source: PathBuf::from("/watch/in/a"),
            target: PathBuf::from("/watch/out/a"),
            bytes: 3,
        };
        assert_eq!(copied.path(), &PathBuf::from("/watch/in/a"));
        assert!(!copied.is_failure());

        let failed = DispatchOutcome::Failed {
            path: PathBuf::from("/watch/in/b"),
            reason: "gone".to_string(),
        };
        assert_eq!(failed.path(), &PathBuf::from("/watch/in/b"));
        assert!(failed.is_failure());
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = DispatchOutcome::Unmatched(PathBuf::from("/tmp/x"));
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json, r#"{"Unmatched":"/tmp/x"}"#);
    }
}
