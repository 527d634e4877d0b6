//! Import directory watcher.
//!
//! Exports dropped into the directory are picked up after a 500ms quiet
//! period and handed to the async side over a tokio channel. Only top-level
//! `.json` and `.xlsx` files are considered.

use crate::upload::FileKind;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const DEBOUNCE_MS: u64 = 500;

/// Whether a path looks like an export we can ingest. Hidden files and
/// editor temp files are ignored.
pub fn is_importable(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && !name.starts_with("~$") && FileKind::from_name(name).is_some()
}

/// Most recently modified importable file, used for the startup import.
pub fn latest_importable(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_importable(path))
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

/// Start watching `dir` on a dedicated thread. The thread stops once the
/// receiver is dropped.
pub fn spawn(dir: PathBuf) -> mpsc::Receiver<PathBuf> {
    let (tx, rx) = mpsc::channel::<PathBuf>(32);

    if !dir.exists() {
        match fs::create_dir_all(&dir) {
            Ok(()) => info!("Created import directory: {}", dir.display()),
            Err(e) => error!("Failed to create import directory {}: {}", dir.display(), e),
        }
    }

    let closed = tx.clone();
    std::thread::spawn(move || {
        let mut debouncer = match new_debouncer(
            Duration::from_millis(DEBOUNCE_MS),
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(events) => {
                    for event in events {
                        if !matches!(event.kind, DebouncedEventKind::Any) {
                            continue;
                        }
                        if !event.path.is_file() || !is_importable(&event.path) {
                            debug!("Ignoring {}", event.path.display());
                            continue;
                        }
                        if let Err(e) = tx.blocking_send(event.path) {
                            debug!("Import channel closed: {}", e);
                        }
                    }
                }
                Err(e) => error!("Import watcher error: {:?}", e),
            },
        ) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create import watcher: {}", e);
                return;
            }
        };

        if let Err(e) = debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive) {
            error!("Failed to watch {}: {}", dir.display(), e);
            return;
        }
        info!("Watching {} for exports", dir.display());

        while !closed.is_closed() {
            std::thread::sleep(Duration::from_secs(1));
        }
        debug!("Import watcher for {} stopped", dir.display());
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_importable() {
        assert!(is_importable(Path::new("/tmp/export.json")));
        assert!(is_importable(Path::new("/tmp/Export.XLSX")));
        assert!(!is_importable(Path::new("/tmp/.export.json")));
        assert!(!is_importable(Path::new("/tmp/~$export.xlsx")));
        assert!(!is_importable(Path::new("/tmp/export.csv")));
    }

    #[test]
    fn test_latest_importable() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_importable(dir.path()), None);

        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("a.json"), "[]").unwrap();
        assert_eq!(latest_importable(dir.path()), Some(dir.path().join("a.json")));

        assert_eq!(latest_importable(&dir.path().join("missing")), None);
    }

    #[tokio::test]
    async fn test_watcher_reports_new_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = spawn(dir.path().to_path_buf());
        tokio::time::sleep(Duration::from_millis(300)).await;

        fs::write(dir.path().join("ignored.txt"), "x").unwrap();
        fs::write(dir.path().join("export.json"), "[]").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "export.json");
    }
}
