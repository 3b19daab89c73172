//! Plugin change notification
//!
//! The gateway does not serve plugins itself. It only watches the plugin
//! directory and tells the browser, through the next proxied response, that
//! it should reload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One-shot "plugins changed" flag shared between the poller and the router
#[derive(Debug, Default)]
pub struct PluginSignal {
    changed: AtomicBool,
}

impl PluginSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raise the flag
    pub fn mark(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }
}

/// Summary of a directory tree; any file added, removed or touched changes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Fingerprint {
    files: u64,
    bytes: u64,
    newest: Option<SystemTime>,
}

fn fingerprint(dir: &Path) -> Fingerprint {
    let mut print = Fingerprint::default();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                pending.push(entry.path());
            }
            print.files += 1;
            print.bytes += meta.len();
            if let Ok(modified) = meta.modified() {
                print.newest = print.newest.max(Some(modified));
            }
        }
    }

    print
}

/// Poll `dir` every `interval` and raise `signal` when its contents change
pub async fn watch_plugin_dir(
    dir: PathBuf,
    interval: Duration,
    signal: Arc<PluginSignal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !dir.is_dir() {
        warn!(path = %dir.display(), "Plugin directory does not exist, watching for it to appear");
    }

    let mut last = scan(&dir).await;
    info!(path = %dir.display(), interval_ms = interval.as_millis() as u64, "Watching plugin directory");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let current = scan(&dir).await;
                if current != last {
                    debug!(path = %dir.display(), files = current.files, "Plugin directory changed");
                    signal.mark();
                    last = current;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn scan(dir: &Path) -> Fingerprint {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint(&dir))
        .await
        .unwrap_or_default()
}
