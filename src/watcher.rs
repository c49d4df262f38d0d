//! Socket discovery
//!
//! Runtime sockets routinely appear after the worker starts (rootless
//! Podman lives under `/run/user/<uid>/podman/`, and those directories may
//! not exist yet). For every configured socket that is missing, a watch is
//! attached to the deepest existing ancestor directory; as directories
//! materialize the watch is re-attached closer to the socket until the
//! socket itself appears. Every re-attach re-checks for the socket, so a
//! creation racing the watch move is never lost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::{Event as FsEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::EngineKind;
use crate::error::{Result, WorkerError};

/// A socket that has not appeared yet
struct PendingSocket {
    kind: EngineKind,
    /// Directory currently being watched on this socket's behalf
    watched_dir: PathBuf,
}

pub struct SocketWatcher {
    watcher: RecommendedWatcher,
    pending: HashMap<PathBuf, PendingSocket>,
    /// Watch refcounts; several pending sockets may share an ancestor
    dirs: HashMap<PathBuf, usize>,
}

impl SocketWatcher {
    /// Create the watcher and the channel its filesystem events arrive on
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<FsEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(
            move |result: std::result::Result<FsEvent, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(error) => warn!(%error, "filesystem watch error"),
            },
        )?;
        Ok((
            Self {
                watcher,
                pending: HashMap::new(),
                dirs: HashMap::new(),
            },
            rx,
        ))
    }

    /// Register a missing socket: watch the deepest ancestor directory that
    /// exists, walking up the tree until a watch attaches.
    pub fn register(&mut self, kind: EngineKind, socket: impl Into<PathBuf>) -> Result<()> {
        let socket = socket.into();
        let dir = self.attach(&socket)?;
        debug!(socket = %socket.display(), dir = %dir.display(), engine = kind.config_name(), "waiting for socket");
        self.pending.insert(socket, PendingSocket { kind, watched_dir: dir });
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Process one filesystem event. Returns the (engine, socket) pairs
    /// that are now ready to be built.
    pub fn handle_event(&mut self, event: &FsEvent) -> Vec<(EngineKind, PathBuf)> {
        if !matches!(event.kind, EventKind::Create(_)) {
            return Vec::new();
        }

        let mut ready = Vec::new();
        for path in &event.paths {
            // Exact hit: the socket itself appeared.
            if self.pending.contains_key(path) {
                self.resolve(path, &mut ready);
                continue;
            }

            // A directory on the way to a pending socket appeared: move
            // each affected watch as close to its socket as possible.
            if path.is_dir() {
                let affected: Vec<PathBuf> = self
                    .pending
                    .keys()
                    .filter(|socket| socket.starts_with(path))
                    .cloned()
                    .collect();

                for socket in affected {
                    // The socket may have appeared while the directory
                    // event was in flight.
                    if socket.exists() {
                        self.resolve(&socket, &mut ready);
                        continue;
                    }
                    let Some(old_dir) = self
                        .pending
                        .get(&socket)
                        .map(|entry| entry.watched_dir.clone())
                    else {
                        continue;
                    };
                    match self.attach(&socket) {
                        Ok(new_dir) => {
                            self.unwatch_dir(&old_dir);
                            if let Some(entry) = self.pending.get_mut(&socket) {
                                entry.watched_dir = new_dir;
                            }
                            // Re-check after the move: creation may have
                            // raced the re-attach.
                            if socket.exists() {
                                self.resolve(&socket, &mut ready);
                            }
                        }
                        Err(error) => {
                            warn!(socket = %socket.display(), %error, "failed to move watch closer");
                        }
                    }
                }
            }
        }
        ready
    }

    /// A pending socket exists now: drop its watch and hand it back
    fn resolve(&mut self, socket: &Path, ready: &mut Vec<(EngineKind, PathBuf)>) {
        if let Some((socket, entry)) = self.pending.remove_entry(socket) {
            self.unwatch_dir(&entry.watched_dir);
            ready.push((entry.kind, socket));
        }
    }

    /// Watch the deepest existing ancestor of `socket`, walking upward on
    /// failure. Returns the directory the watch landed on.
    fn attach(&mut self, socket: &Path) -> Result<PathBuf> {
        let mut dir = socket
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WorkerError::Other(format!("socket {} has no parent", socket.display())))?;

        loop {
            match self.watch_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(error) => {
                    debug!(dir = %dir.display(), %error, "walking up to a watchable ancestor");
                    dir = dir
                        .parent()
                        .map(Path::to_path_buf)
                        .ok_or_else(|| {
                            WorkerError::Other(format!(
                                "no watchable ancestor for {}",
                                socket.display()
                            ))
                        })?;
                }
            }
        }
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        if let Some(count) = self.dirs.get_mut(dir) {
            *count += 1;
            return Ok(());
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.dirs.insert(dir.to_path_buf(), 1);
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) {
        let Some(count) = self.dirs.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.dirs.remove(dir);
            if let Err(error) = self.watcher.unwatch(dir) {
                debug!(dir = %dir.display(), %error, "unwatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_ready(
        watcher: &mut SocketWatcher,
        rx: &mut mpsc::UnboundedReceiver<FsEvent>,
    ) -> Vec<(EngineKind, PathBuf)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for filesystem event")
                .expect("watcher channel closed");
            let ready = watcher.handle_event(&event);
            if !ready.is_empty() {
                return ready;
            }
        }
    }

    #[tokio::test]
    async fn socket_created_in_watched_dir() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");

        let (mut watcher, mut rx) = SocketWatcher::new().unwrap();
        watcher.register(EngineKind::Docker, &socket).unwrap();
        assert!(watcher.has_pending());

        std::fs::File::create(&socket).unwrap();

        let ready = next_ready(&mut watcher, &mut rx).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, EngineKind::Docker);
        assert_eq!(ready[0].1, socket);
        assert!(!watcher.has_pending());
    }

    #[tokio::test]
    async fn drills_down_through_created_directories() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("user").join("1000").join("podman.sock");

        let (mut watcher, mut rx) = SocketWatcher::new().unwrap();
        // Intermediate directories do not exist; the watch lands on the
        // tempdir itself.
        watcher.register(EngineKind::Podman, &socket).unwrap();

        // Both intermediate levels appear at once. Processing the directory
        // event re-attaches the watch at the deepest existing directory.
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = rx.try_recv() {
            let ready = watcher.handle_event(&event);
            assert!(ready.is_empty());
        }

        std::fs::File::create(&socket).unwrap();

        let ready = next_ready(&mut watcher, &mut rx).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1, socket);
    }

    #[tokio::test]
    async fn socket_appearing_before_drill_down_is_still_found() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("podman").join("podman.sock");

        let (mut watcher, mut rx) = SocketWatcher::new().unwrap();
        watcher.register(EngineKind::Podman, &socket).unwrap();

        // Create directory and socket back to back: by the time the
        // directory event is processed the socket already exists.
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::File::create(&socket).unwrap();

        let ready = next_ready(&mut watcher, &mut rx).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1, socket);
    }

    #[tokio::test]
    async fn two_sockets_can_share_a_watched_dir() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("docker.sock");
        let second = dir.path().join("podman.sock");

        let (mut watcher, mut rx) = SocketWatcher::new().unwrap();
        watcher.register(EngineKind::Docker, &first).unwrap();
        watcher.register(EngineKind::Podman, &second).unwrap();

        std::fs::File::create(&first).unwrap();
        let ready = next_ready(&mut watcher, &mut rx).await;
        assert_eq!(ready, vec![(EngineKind::Docker, first)]);
        assert!(watcher.has_pending());

        std::fs::File::create(&second).unwrap();
        let ready = next_ready(&mut watcher, &mut rx).await;
        assert_eq!(ready, vec![(EngineKind::Podman, second)]);
        assert!(!watcher.has_pending());
    }

    #[tokio::test]
    async fn register_fails_without_watchable_ancestor() {
        let (mut watcher, _rx) = SocketWatcher::new().unwrap();
        // Relative single-component path: no parent directory to watch.
        let result = watcher.register(EngineKind::Docker, PathBuf::from("sock"));
        assert!(result.is_err());
    }
}
