//! Debounced file watching with retry.
//!
//! The watcher runs on its own thread and forwards root-relative path
//! batches to the recompute loop. If the OS watch fails it is re-created
//! with exponential backoff; the dev session keeps running meanwhile.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebouncedEventKind};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{CrxError, CrxResult};

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt. Doubles up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub root: PathBuf,
    /// Root-relative prefixes whose changes are dropped.
    pub ignore: Vec<PathBuf>,
    pub debounce: Duration,
    pub retry: Backoff,
}

/// Spawn the watcher thread. It stops when `running` is cleared or the
/// receiving side of `batches` is gone.
pub fn spawn(
    options: WatchOptions,
    batches: UnboundedSender<Vec<PathBuf>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut retry = options.retry.clone();

        while running.load(Ordering::SeqCst) {
            match watch(&options, &batches, &running, &mut retry) {
                Ok(()) => break,
                Err(e) => {
                    let delay = retry.next_delay();
                    tracing::warn!("{}; retrying in {:?}", e, delay);
                    thread::sleep(delay);
                }
            }
        }
        tracing::debug!("Watcher stopped");
    })
}

/// Watch until stopped (`Ok`) or until the watch breaks (`Err`).
fn watch(
    options: &WatchOptions,
    batches: &UnboundedSender<Vec<PathBuf>>,
    running: &AtomicBool,
    retry: &mut Backoff,
) -> CrxResult<()> {
    let (tx, rx) = channel();
    let mut debouncer =
        new_debouncer(options.debounce, tx).map_err(|e| CrxError::Watch(e.to_string()))?;
    debouncer
        .watcher()
        .watch(&options.root, RecursiveMode::Recursive)
        .map_err(|e| CrxError::Watch(e.to_string()))?;
    retry.reset();

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                let changed = events
                    .iter()
                    .filter(|e| matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous))
                    .map(|e| e.path.as_path());
                let paths = filter_paths(&options.root, &options.ignore, changed);
                if !paths.is_empty() && batches.send(paths).is_err() {
                    return Ok(());
                }
            }
            Ok(Err(e)) => return Err(CrxError::Watch(format!("{:?}", e))),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CrxError::Watch("watcher disconnected".into()))
            }
        }
    }
    Ok(())
}

/// Root-relative, deduplicated paths outside ignored and hidden directories.
pub fn filter_paths<'a>(
    root: &Path,
    ignore: &[PathBuf],
    paths: impl IntoIterator<Item = &'a Path>,
) -> Vec<PathBuf> {
    let mut kept = BTreeSet::new();

    for path in paths {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if ignore.iter().any(|prefix| rel.starts_with(prefix)) {
            continue;
        }
        let hidden = rel.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name.starts_with('.') || name == "node_modules"
        });
        if hidden || rel.as_os_str().is_empty() {
            continue;
        }
        kept.insert(rel.to_path_buf());
    }

    kept.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(3000));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_filter_paths() {
        let root = Path::new("/project");
        let ignore = vec![PathBuf::from("dist")];
        let events = [
            Path::new("/project/src/util.ts"),
            Path::new("/project/src/util.ts"),
            Path::new("/project/dist/manifest.json"),
            Path::new("/project/node_modules/lib/index.js"),
            Path::new("/project/.git/index"),
            Path::new("/project/.dist.staging/a.js"),
            Path::new("/elsewhere/file.ts"),
            Path::new("/project/manifest.json"),
        ];

        assert_eq!(
            filter_paths(root, &ignore, events),
            vec![PathBuf::from("manifest.json"), PathBuf::from("src/util.ts")]
        );
    }

    #[test]
    fn test_watcher_reports_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let handle = spawn(
            WatchOptions {
                root: root.clone(),
                ignore: vec![],
                debounce: Duration::from_millis(50),
                retry: Backoff::new(Duration::from_millis(50), Duration::from_millis(200)),
            },
            tx,
            running.clone(),
        );

        // Give the OS watch a moment to register
        thread::sleep(Duration::from_millis(300));
        std::fs::write(root.join("a.ts"), "export {}").unwrap();

        let mut seen = Vec::new();
        for _ in 0..50 {
            while let Ok(batch) = rx.try_recv() {
                seen.extend(batch);
            }
            if seen.contains(&PathBuf::from("a.ts")) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(seen.contains(&PathBuf::from("a.ts")));
    }
}
