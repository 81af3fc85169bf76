//! Debounced recursive watcher over the backend source tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create file watcher: {0}")]
    WatcherCreation(String),

    #[error("failed to watch path '{path}': {message}")]
    WatchPath { path: String, message: String },
}

/// Calls `on_change` once per debounced burst of file changes.
///
/// Watching stops when the value is dropped.
pub struct SourceWatcher {
    root: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl SourceWatcher {
    pub fn watch<F>(root: &Path, debounce: Duration, on_change: F) -> Result<Self, WatchError>
    where
        F: Fn(Vec<PathBuf>) + Send + 'static,
    {
        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| e.kind == DebouncedEventKind::Any)
                        .map(|e| e.path)
                        .collect();
                    if !paths.is_empty() {
                        on_change(paths);
                    }
                }
                Err(e) => log::error!("File watcher error: {e}"),
            },
        )
        .map_err(|e| WatchError::WatcherCreation(e.to_string()))?;

        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::WatchPath {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;

        log::info!(
            "Watching {} for source changes (debounce {}ms)",
            root.display(),
            debounce.as_millis()
        );

        Ok(Self {
            root: root.to_path_buf(),
            _debouncer: debouncer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_missing_root_fails() {
        let result = SourceWatcher::watch(
            Path::new("/definitely/not/a/real/dir"),
            Duration::from_millis(50),
            |_| {},
        );
        assert!(matches!(result, Err(WatchError::WatchPath { .. })));
    }

    #[test]
    fn test_change_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let watcher = SourceWatcher::watch(dir.path(), Duration::from_millis(50), move |paths| {
            let _ = tx.send(paths);
        })
        .unwrap();
        assert_eq!(watcher.root(), dir.path());

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        let paths = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!paths.is_empty());
    }
}
