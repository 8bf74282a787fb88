//! File watcher events and a polling fallback scanner.
//!
//! The platform watcher itself is a collaborator; the registry consumes
//! [`FileEvent`]s regardless of where they come from. [`PollingWatcher`]
//! walks the asset root and diffs modification times, which is enough for
//! tooling and tests on any platform.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    Added,
    Modified,
    Renamed { new_path: String },
    Deleted,
}

/// One watcher event; `path` is relative to the asset root, forward-slash
/// normalized by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug)]
pub struct PollingWatcher {
    root: PathBuf,
    snapshot: HashMap<String, u64>,
    sender: Sender<FileEvent>,
    receiver: Receiver<FileEvent>,
}

impl PollingWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (sender, receiver) = unbounded();
        let mut watcher = Self {
            root: root.into(),
            snapshot: HashMap::new(),
            sender,
            receiver,
        };
        // the initial scan primes the snapshot without emitting events
        watcher.snapshot = watcher.scan();
        watcher
    }

    pub fn events(&self) -> Receiver<FileEvent> {
        self.receiver.clone()
    }

    /// Inject an externally observed event (used when a real platform
    /// watcher feeds this queue, and by tests).
    pub fn push(&self, event: FileEvent) {
        let _ = self.sender.send(event);
    }

    fn scan(&self) -> HashMap<String, u64> {
        let mut files = HashMap::new();
        let mut directories = vec![self.root.clone()];
        while let Some(directory) = directories.pop() {
            let entries = match std::fs::read_dir(&directory) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("watcher failed to read {}: {err}", directory.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    directories.push(path);
                    continue;
                }
                let Some(relative) = relative_to(&path, &self.root) else {
                    continue;
                };
                let mtime = std::fs::metadata(&path)
                    .and_then(|metadata| metadata.modified())
                    .ok()
                    .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|duration| duration.as_nanos() as u64)
                    .unwrap_or(0);
                files.insert(relative, mtime);
            }
        }
        files
    }

    /// Diff the tree against the previous poll and emit events.
    pub fn poll(&mut self) {
        let current = self.scan();
        for (path, mtime) in &current {
            match self.snapshot.get(path) {
                None => self.push(FileEvent {
                    path: path.clone(),
                    kind: FileEventKind::Added,
                }),
                Some(previous) if previous != mtime => self.push(FileEvent {
                    path: path.clone(),
                    kind: FileEventKind::Modified,
                }),
                _ => {}
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                self.push(FileEvent {
                    path: path.clone(),
                    kind: FileEventKind::Deleted,
                });
            }
        }
        self.snapshot = current;
    }
}

fn relative_to(path: &Path, root: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|relative| relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_emits_add_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollingWatcher::new(dir.path());

        std::fs::write(dir.path().join("wood.png"), b"pixels").unwrap();
        watcher.poll();
        let events = watcher.events();
        assert_eq!(
            events.try_recv().unwrap(),
            FileEvent {
                path: "wood.png".into(),
                kind: FileEventKind::Added
            }
        );

        // a strictly newer mtime
        let file = dir.path().join("wood.png");
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::write(&file, b"more pixels").unwrap();
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .open(&file)
            .and_then(|f| f.set_modified(later));
        watcher.poll();
        assert_eq!(
            events.try_recv().unwrap(),
            FileEvent {
                path: "wood.png".into(),
                kind: FileEventKind::Modified
            }
        );

        std::fs::remove_file(&file).unwrap();
        watcher.poll();
        assert_eq!(
            events.try_recv().unwrap(),
            FileEvent {
                path: "wood.png".into(),
                kind: FileEventKind::Deleted
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn subdirectories_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollingWatcher::new(dir.path());
        std::fs::create_dir_all(dir.path().join("textures")).unwrap();
        std::fs::write(dir.path().join("textures/brick.png"), b"x").unwrap();
        watcher.poll();
        let event = watcher.events().try_recv().unwrap();
        assert_eq!(event.path, "textures/brick.png");
        assert_eq!(event.kind, FileEventKind::Added);
    }
}
