//! File watcher for the decision-tree document.
//!
//! Watches the tree file's directory (editors often replace files rather
//! than write in place) and calls `reload_if_changed` after a debounce
//! window. The content hash check makes spurious events harmless.

use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::classifier::{IntentClassifier, ReloadOutcome};

/// Debounce window for file system events
const DEBOUNCE_MS: u64 = 500;

/// Start watching the classifier's tree source.
///
/// Must be called from within a tokio runtime. Returns `None` when the
/// classifier has no file source or the watcher cannot be created.
pub fn start_tree_watcher(classifier: Arc<IntentClassifier>) -> Option<JoinHandle<()>> {
    let path = classifier.source()?.to_path_buf();
    let file_name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };

    let (fs_tx, mut fs_rx) = mpsc::channel::<()>(64);

    let mut watcher = match RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = fs_tx.try_send(());
                }
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            log::error!("Tree watcher: failed to create filesystem watcher: {}", e);
            return None;
        }
    };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        log::error!("Tree watcher: failed to watch {}: {}", dir.display(), e);
        return None;
    }

    log::info!("Tree watcher: watching {}", path.display());

    Some(tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task
        let _watcher = watcher;

        loop {
            if fs_rx.recv().await.is_none() {
                break;
            }

            // Debounce: drain any events that arrive within the window
            sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            while fs_rx.try_recv().is_ok() {}

            match classifier.reload_if_changed() {
                ReloadOutcome::Reloaded => log::debug!("Tree watcher: tree reloaded"),
                ReloadOutcome::Unchanged => {}
                ReloadOutcome::Failed(e) => log::debug!("Tree watcher: reload skipped: {}", e),
            }
        }

        log::info!("Tree watcher: stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_classifier_has_nothing_to_watch() {
        let classifier = Arc::new(IntentClassifier::builtin());
        assert!(start_tree_watcher(classifier).is_none());
    }

    #[tokio::test]
    async fn test_watcher_starts_for_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, r#"{"root": {"action": "HELP"}}"#).unwrap();
        let classifier = Arc::new(IntentClassifier::from_path(&path));
        let handle = start_tree_watcher(classifier).expect("watcher should start");
        handle.abort();
    }
}
