//! Polling watcher over the plugin root
//!
//! Takes a filesystem snapshot every poll interval and compares it against
//! the previous one. Any difference, including renames to or from the `_`
//! disable marker, produces a single reload request; the poll interval is
//! the debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::plugins::discovery::{self, SourceKind, OVERLAY_FILE};
use crate::plugins::manager::ReloadRequest;

/// Snapshot of every file under the plugin root, keyed by path
type Snapshot = HashMap<PathBuf, u64>;

pub struct PluginWatcher {
    root: PathBuf,
    interval: Duration,
    requests: mpsc::UnboundedSender<ReloadRequest>,
}

impl PluginWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        interval: Duration,
        requests: mpsc::UnboundedSender<ReloadRequest>,
    ) -> Self {
        Self {
            root: root.into(),
            interval,
            requests,
        }
    }

    /// Poll until shutdown is signalled or the request channel closes.
    ///
    /// The first snapshot is the baseline; it never triggers a request, so
    /// starting the watcher after the initial reload cycle is quiet.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick of tokio's interval fires immediately
        ticker.tick().await;

        let mut previous = snapshot(&self.root);
        tracing::debug!(
            root = %self.root.display(),
            files = previous.len(),
            interval_secs = self.interval.as_secs(),
            "Watcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = snapshot(&self.root);
                    let changed = diff(&previous, &current);
                    previous = current;

                    if changed.is_empty() {
                        continue;
                    }

                    let request = classify(&self.root, changed);
                    tracing::info!(
                        reason = ?request.reason,
                        paths = request.trigger_paths.len(),
                        "Watcher detected changes"
                    );
                    if self.requests.send(request).is_err() {
                        tracing::debug!("Reload channel closed, watcher stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Watcher stopped");
                    break;
                }
            }
        }
    }
}

/// Per-file signatures for everything under `root`. A missing root yields an
/// empty snapshot; the resulting diff surfaces as removals and the reload
/// cycle reports the real error.
fn snapshot(root: &Path) -> Snapshot {
    let mut files = Snapshot::new();
    collect(root, &mut files);
    files
}

fn collect(dir: &Path, files: &mut Snapshot) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, files);
        } else {
            let sig = discovery::source_signature(&path, SourceKind::Unit);
            files.insert(path, sig);
        }
    }
}

/// Paths added, removed, or modified between two snapshots
fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<PathBuf> {
    let mut changed = Vec::new();
    for (path, sig) in current {
        if previous.get(path) != Some(sig) {
            changed.push(path.clone());
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            changed.push(path.clone());
        }
    }
    changed.sort();
    changed
}

/// An overlay config touch outranks plain manifest edits for the reported
/// reason; the resulting cycle is identical either way.
fn classify(root: &Path, changed: Vec<PathBuf>) -> ReloadRequest {
    let overlay = root.join(OVERLAY_FILE);
    if changed.iter().any(|p| *p == overlay) {
        ReloadRequest::config_change(changed)
    } else {
        ReloadRequest::file_change(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manager::ReloadReason;

    fn touch(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_diff_reports_add_modify_remove() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("a.plugin.yaml");
        let b = root.path().join("b.plugin.yaml");
        touch(&a, "{}\n");
        touch(&b, "{}\n");
        let before = snapshot(root.path());

        touch(&a, "description: changed\n");
        std::fs::remove_file(&b).unwrap();
        let c = root.path().join("c.plugin.yaml");
        touch(&c, "{}\n");
        let after = snapshot(root.path());

        let changed = diff(&before, &after);
        assert_eq!(changed, vec![a, b, c]);
    }

    #[test]
    fn test_identical_snapshots_produce_no_changes() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("a.plugin.yaml"), "{}\n");
        let before = snapshot(root.path());
        let after = snapshot(root.path());
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn test_rename_to_disable_marker_is_visible() {
        let root = tempfile::tempdir().unwrap();
        let live = root.path().join("a.plugin.yaml");
        touch(&live, "{}\n");
        let before = snapshot(root.path());

        let disabled = root.path().join("_a.plugin.yaml");
        std::fs::rename(&live, &disabled).unwrap();
        let after = snapshot(root.path());

        let changed = diff(&before, &after);
        assert_eq!(changed, vec![disabled, live]);
    }

    #[test]
    fn test_overlay_touch_classified_as_config_change() {
        let root = tempfile::tempdir().unwrap();
        let overlay = root.path().join(OVERLAY_FILE);
        let request = classify(root.path(), vec![overlay]);
        assert_eq!(request.reason, ReloadReason::ConfigChange);

        let manifest = root.path().join("a.plugin.yaml");
        let request = classify(root.path(), vec![manifest]);
        assert_eq!(request.reason, ReloadReason::FileChange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_request_after_change() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("a.plugin.yaml"), "{}\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1), tx);
        let handle = tokio::spawn(watcher.run(shutdown_rx));

        // Let the baseline snapshot land, then change a file
        tokio::time::sleep(Duration::from_millis(1500)).await;
        touch(&root.path().join("b.plugin.yaml"), "{}\n");
        tokio::time::sleep(Duration::from_secs(2)).await;

        let request = rx.try_recv().expect("watcher should emit a request");
        assert_eq!(request.reason, ReloadReason::FileChange);
        assert!(request
            .trigger_paths
            .iter()
            .any(|p| p.ends_with("b.plugin.yaml")));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_quiet_without_changes() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("a.plugin.yaml"), "{}\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = PluginWatcher::new(root.path(), Duration::from_secs(1), tx);
        let handle = tokio::spawn(watcher.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
