//! Inotify-driven change-detection state machine (spec §4.12).
//!
//! Ported from `file_manager.py::InotifyObserver`/`InotifyNode`'s event
//! demux and the three pending-event tables it maintains (move cookies,
//! created/modified, delete batches). The kernel-level watch plumbing is
//! delegated to the `notify` crate, whose recursive-mode Linux backend
//! already arms new subdirectories as they're created, so this module
//! owns only the demux and debounce timers.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode as NotifyAccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::event::EventBus;
use crate::files::metadata::MetadataCache;
use crate::files::roots::{FileRoot, FileRootsManager, VALID_GCODE_EXTS};

/// TTL for a directory move cookie (spec §3 pending-file-event tables).
pub const DIR_MOVE_TTL: Duration = Duration::from_millis(1000);
/// TTL for a file move cookie, and for a file's delete-batch window.
pub const FILE_MOVE_TTL: Duration = Duration::from_millis(250);
pub const DELETE_BATCH_TTL: Duration = Duration::from_millis(250);

/// A demuxed, semantically meaningful filesystem change, emitted on the
/// event bus as `file_manager:<variant>` (spec §4.12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    CreateFile { root: String, path: String },
    ModifyFile { root: String, path: String },
    DeleteFile { root: String, path: String },
    MoveFile { root: String, path: String, source_root: String, source_path: String },
    CreateDir { root: String, path: String },
    DeleteDir { root: String, path: String },
    MoveDir { root: String, path: String, source_root: String, source_path: String },
}

impl ChangeEvent {
    fn emit(self, events: &EventBus) {
        let (name, value) = match &self {
            ChangeEvent::CreateFile { root, path } => ("file_manager:create_file", serde_json::json!({"root": root, "path": path})),
            ChangeEvent::ModifyFile { root, path } => ("file_manager:modify_file", serde_json::json!({"root": root, "path": path})),
            ChangeEvent::DeleteFile { root, path } => ("file_manager:delete_file", serde_json::json!({"root": root, "path": path})),
            ChangeEvent::MoveFile { root, path, source_root, source_path } => (
                "file_manager:move_file",
                serde_json::json!({"root": root, "path": path, "source_root": source_root, "source_path": source_path}),
            ),
            ChangeEvent::CreateDir { root, path } => ("file_manager:create_dir", serde_json::json!({"root": root, "path": path})),
            ChangeEvent::DeleteDir { root, path } => ("file_manager:delete_dir", serde_json::json!({"root": root, "path": path})),
            ChangeEvent::MoveDir { root, path, source_root, source_path } => (
                "file_manager:move_dir",
                serde_json::json!({"root": root, "path": path, "source_root": source_root, "source_path": source_path}),
            ),
        };
        events.emit(name, vec![value]);
    }
}

struct MoveCookieEntry {
    root: String,
    previous_path: PathBuf,
    is_directory: bool,
    generation: u64,
}

struct DeleteBatchEntry {
    root: String,
    filenames: HashSet<String>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    move_cookies: HashMap<usize, MoveCookieEntry>,
    created: HashMap<PathBuf, String>,
    modified: HashMap<PathBuf, String>,
    deleted_in_dir: HashMap<PathBuf, DeleteBatchEntry>,
    /// Every directory path this watcher currently knows about, kept up
    /// to date on create/delete/move so that `on_moved_from` can tell
    /// whether a renamed-away path was a directory without stat'ing it
    /// (by the time that handler runs, the kernel's rename has already
    /// completed and the old path no longer exists). Mirrors the role
    /// `file_manager.py::InotifyObserver`'s `watched_dirs` plays: the
    /// original learns directory-ness from the raw inotify event's
    /// `ISDIR` bit at dispatch time; `notify`'s portable event doesn't
    /// carry that for `RenameMode::From`, so this set stands in for it.
    watched_dirs: HashSet<PathBuf>,
}

/// Owns the pending-event tables and debounce timers for every watched
/// writable root. One instance per server.
#[derive(Clone)]
pub struct ChangeWatcher {
    roots: Arc<FileRootsManager>,
    metadata: MetadataCache,
    events: EventBus,
    inner: Arc<tokio::sync::Mutex<Inner>>,
    generation: Arc<AtomicU64>,
}

impl ChangeWatcher {
    pub fn new(roots: Arc<FileRootsManager>, metadata: MetadataCache, events: EventBus) -> Self {
        Self {
            roots,
            metadata,
            events,
            inner: Arc::new(tokio::sync::Mutex::new(Inner::default())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arms a recursive inotify watch on `root.path` and spawns the demux
    /// task. Returns a guard that must be kept alive for the watch to
    /// stay active.
    pub fn watch_root(&self, root: &FileRoot) -> Result<WatchGuard, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root_path = root.path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&root_path, RecursiveMode::Recursive)?;

        self.seed_watched_dirs(&root_path);

        let this = self.clone();
        let root_name = root.name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_event(&root_name, &root_path, event).await;
            }
        });

        Ok(WatchGuard { _watcher: watcher })
    }

    /// Populates `watched_dirs` with every directory already on disk
    /// under `root_path`, so `on_moved_from` can recognize pre-existing
    /// directories moved away before this watcher ever saw a create
    /// event for them.
    fn seed_watched_dirs(&self, root_path: &Path) {
        let mut dirs: Vec<PathBuf> =
            WalkDir::new(root_path).into_iter().filter_map(Result::ok).filter(|e| e.file_type().is_dir()).map(|e| e.into_path()).collect();
        dirs.push(root_path.to_path_buf());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut inner = inner.lock().await;
            inner.watched_dirs.extend(dirs);
        });
    }

    async fn handle_event(&self, root_name: &str, root_path: &Path, event: Event) {
        if let Err(err) = self.demux(root_name, root_path, event).await {
            tracing::warn!(root = root_name, %err, "change watcher dropped a malformed event");
        }
    }

    async fn demux(&self, root_name: &str, root_path: &Path, event: Event) -> Result<(), String> {
        let cookie = event.attrs.tracker();
        match event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    if is_hidden(path) {
                        continue;
                    }
                    let is_dir = matches!(kind, CreateKind::Folder) || (matches!(kind, CreateKind::Any) && path.is_dir());
                    if is_dir {
                        self.inner.lock().await.watched_dirs.insert(path.clone());
                        let rel = relative(root_path, path);
                        self.emit(ChangeEvent::CreateDir { root: root_name.to_string(), path: rel }).await;
                    } else {
                        if !self.is_gcode_path(root_name, path) {
                            continue;
                        }
                        let mut inner = self.inner.lock().await;
                        inner.created.insert(path.clone(), root_name.to_string());
                    }
                }
            }
            EventKind::Modify(ModifyKind::Data(_)) => {
                for path in &event.paths {
                    if is_hidden(path) || path.is_dir() || !self.is_gcode_path(root_name, path) {
                        continue;
                    }
                    let mut inner = self.inner.lock().await;
                    if !inner.created.contains_key(path) {
                        inner.modified.insert(path.clone(), root_name.to_string());
                    }
                }
            }
            EventKind::Access(AccessKind::Close(NotifyAccessMode::Write)) => {
                for path in &event.paths {
                    if is_hidden(path) || !self.is_gcode_path(root_name, path) {
                        continue;
                    }
                    self.on_write_close(root_name, root_path, path).await;
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    if is_hidden(path) {
                        continue;
                    }
                    if matches!(kind, RemoveKind::Folder) {
                        self.on_dir_removed(root_name, root_path, path).await;
                    } else {
                        self.on_file_removed(root_name, root_path, path).await;
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let (Some(cookie), Some(path)) = (cookie, event.paths.first()) {
                    if is_hidden(path) {
                        return Ok(());
                    }
                    self.on_moved_from(cookie, root_name, root_path, path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let (Some(cookie), Some(path)) = (cookie, event.paths.first()) {
                    if is_hidden(path) {
                        return Ok(());
                    }
                    self.on_moved_to(cookie, root_name, root_path, path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() == 2 {
                    let from = event.paths[0].clone();
                    let to = event.paths[1].clone();
                    self.on_direct_rename(root_name, root_path, &from, &to).await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_gcode_path(&self, root_name: &str, path: &Path) -> bool {
        if root_name != "gcodes" {
            return true;
        }
        let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy().to_lowercase())).unwrap_or_default();
        VALID_GCODE_EXTS.contains(&ext.as_str())
    }

    async fn on_write_close(&self, root_name: &str, root_path: &Path, path: &Path) {
        let promoted = {
            let mut inner = self.inner.lock().await;
            if inner.created.remove(path).is_some() {
                Some(true)
            } else if inner.modified.remove(path).is_some() {
                Some(false)
            } else {
                None
            }
        };
        let Some(was_create) = promoted else { return };

        if path.extension().and_then(OsStr::to_str).map(|e| e.eq_ignore_ascii_case("ufp")).unwrap_or(false) {
            if let Err(err) = extract_ufp(path).await {
                tracing::warn!(?path, %err, "UFP extraction failed");
            }
        }

        let rel = relative(root_path, path);
        if was_create {
            self.emit(ChangeEvent::CreateFile { root: root_name.to_string(), path: rel.clone() }).await;
        } else {
            self.emit(ChangeEvent::ModifyFile { root: root_name.to_string(), path: rel.clone() }).await;
        }

        if root_name == "gcodes" {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                let _ = self.metadata.parse_metadata(&rel, meta.len(), modified, true).await;
            }
        }
    }

    async fn on_dir_removed(&self, root_name: &str, root_path: &Path, path: &Path) {
        {
            let mut inner = self.inner.lock().await;
            inner.deleted_in_dir.remove(path);
            inner.watched_dirs.remove(path);
        }
        let rel = relative(root_path, path);
        let _ = self.metadata.remove_under(&rel);
        self.emit(ChangeEvent::DeleteDir { root: root_name.to_string(), path: rel }).await;
    }

    async fn on_file_removed(&self, root_name: &str, root_path: &Path, path: &Path) {
        if !self.is_gcode_path(root_name, path) {
            return;
        }
        let Some(parent) = path.parent() else { return };
        let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            let entry = inner.deleted_in_dir.entry(parent.to_path_buf()).or_insert_with(|| DeleteBatchEntry {
                root: root_name.to_string(),
                filenames: HashSet::new(),
                generation,
            });
            entry.filenames.insert(filename);
            entry.generation = generation;
        }

        let this = self.clone();
        let parent = parent.to_path_buf();
        let root_path = root_path.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(DELETE_BATCH_TTL).await;
            this.flush_delete_batch(&parent, &root_path, generation).await;
        });
    }

    async fn flush_delete_batch(&self, dir: &Path, root_path: &Path, generation: u64) {
        let batch = {
            let mut inner = self.inner.lock().await;
            match inner.deleted_in_dir.get(dir) {
                Some(entry) if entry.generation == generation => inner.deleted_in_dir.remove(dir),
                _ => None,
            }
        };
        let Some(batch) = batch else { return };
        for filename in batch.filenames {
            let file_path = dir.join(&filename);
            let rel = relative(root_path, &file_path);
            let _ = self.metadata.remove(&rel);
            self.emit(ChangeEvent::DeleteFile { root: batch.root.clone(), path: rel }).await;
        }
    }

    async fn on_moved_from(&self, cookie: usize, root_name: &str, root_path: &Path, path: &Path) {
        // By the time this handler runs, the kernel's rename has already
        // completed atomically, so `path` no longer exists and stat'ing
        // it would always report "not a directory". Directory-ness has
        // to come from bookkeeping recorded while the path still existed.
        let is_directory;
        let ttl;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            is_directory = inner.watched_dirs.remove(path);
            ttl = if is_directory { DIR_MOVE_TTL } else { FILE_MOVE_TTL };

            if !is_directory && !self.is_gcode_path(root_name, path) {
                return;
            }

            inner.move_cookies.insert(
                cookie,
                MoveCookieEntry { root: root_name.to_string(), previous_path: path.to_path_buf(), is_directory, generation },
            );
        }

        let rel = relative(root_path, path);
        if is_directory {
            let _ = self.metadata.remove_under(&rel);
        } else {
            let _ = self.metadata.remove(&rel);
        }

        let this = self.clone();
        let root_name = root_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            this.expire_move_cookie(cookie, generation, &root_name).await;
        });
    }

    async fn expire_move_cookie(&self, cookie: usize, generation: u64, _root_name: &str) {
        let entry = {
            let mut inner = self.inner.lock().await;
            match inner.move_cookies.get(&cookie) {
                Some(entry) if entry.generation == generation => inner.move_cookies.remove(&cookie),
                _ => None,
            }
        };
        let Some(entry) = entry else { return };
        let rel = entry.previous_path.to_string_lossy().into_owned();
        if entry.is_directory {
            self.emit(ChangeEvent::DeleteDir { root: entry.root, path: rel }).await;
        } else {
            self.emit(ChangeEvent::DeleteFile { root: entry.root, path: rel }).await;
        }
    }

    async fn on_moved_to(&self, cookie: usize, root_name: &str, root_path: &Path, path: &Path) {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.move_cookies.remove(&cookie)
        };

        let Some(entry) = entry else {
            if path.is_dir() {
                self.inner.lock().await.watched_dirs.insert(path.to_path_buf());
                self.emit(ChangeEvent::CreateDir { root: root_name.to_string(), path: relative(root_path, path) }).await;
            } else if self.is_gcode_path(root_name, path) {
                let mut inner = self.inner.lock().await;
                inner.created.insert(path.to_path_buf(), root_name.to_string());
            }
            return;
        };

        let new_rel = relative(root_path, path);
        let old_rel = entry.previous_path.to_string_lossy().into_owned();
        if entry.is_directory {
            self.inner.lock().await.watched_dirs.insert(path.to_path_buf());
            self.emit(ChangeEvent::MoveDir {
                root: root_name.to_string(),
                path: new_rel,
                source_root: entry.root,
                source_path: old_rel,
            })
            .await;
        } else {
            self.emit(ChangeEvent::MoveFile {
                root: root_name.to_string(),
                path: new_rel,
                source_root: entry.root,
                source_path: old_rel,
            })
            .await;
        }
    }

    /// Some platforms (notably macOS's `FSEvents` backend) report a
    /// rename as one event carrying both paths rather than a cookie
    /// pair; handled directly without the move-cookie tables.
    async fn on_direct_rename(&self, root_name: &str, root_path: &Path, from: &Path, to: &Path) {
        if is_hidden(from) || is_hidden(to) {
            return;
        }
        let is_directory = to.is_dir();
        if !is_directory && !self.is_gcode_path(root_name, to) {
            return;
        }
        let new_rel = relative(root_path, to);
        let old_rel = relative(root_path, from);
        if is_directory {
            {
                let mut inner = self.inner.lock().await;
                inner.watched_dirs.remove(from);
                inner.watched_dirs.insert(to.to_path_buf());
            }
            let _ = self.metadata.remove_under(&old_rel);
            self.emit(ChangeEvent::MoveDir {
                root: root_name.to_string(),
                path: new_rel,
                source_root: root_name.to_string(),
                source_path: old_rel,
            })
            .await;
        } else {
            let _ = self.metadata.remove(&old_rel);
            self.emit(ChangeEvent::MoveFile {
                root: root_name.to_string(),
                path: new_rel,
                source_root: root_name.to_string(),
                source_path: old_rel,
            })
            .await;
        }
    }

    async fn emit(&self, event: ChangeEvent) {
        event.emit(&self.events);
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(OsStr::to_str).map(|n| n.starts_with('.')).unwrap_or(false)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).to_string_lossy().into_owned()
}

/// Extracts `/3D/model.gcode` (and `/Metadata/thumbnail.png` if present)
/// from a UFP archive in place of the original file, then deletes the
/// archive (spec §4.12, ported from `metadata.py::extract_ufp`).
async fn extract_ufp(ufp_path: &Path) -> Result<(), String> {
    let dest_path = ufp_path.with_extension("gcode");
    let ufp_path = ufp_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), String> {
        let file = std::fs::File::open(&ufp_path).map_err(|e| e.to_string())?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;

        {
            let mut model = archive.by_name("3D/model.gcode").map_err(|e| e.to_string())?;
            let mut out = std::fs::File::create(&dest_path).map_err(|e| e.to_string())?;
            std::io::copy(&mut model, &mut out).map_err(|e| e.to_string())?;
        }

        if let Ok(mut thumb) = archive.by_name("Metadata/thumbnail.png") {
            if let Some(parent) = dest_path.parent() {
                let thumb_dir = parent.join(".thumbs");
                std::fs::create_dir_all(&thumb_dir).map_err(|e| e.to_string())?;
                let stem = dest_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                let thumb_path = thumb_dir.join(format!("{stem}.png"));
                let mut out = std::fs::File::create(&thumb_path).map_err(|e| e.to_string())?;
                std::io::copy(&mut thumb, &mut out).map_err(|e| e.to_string())?;
            }
        }

        std::fs::remove_file(&ufp_path).map_err(|e| e.to_string())?;
        Ok(())
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Keeps a `notify` watcher alive; dropping it stops the watch.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::files::metadata::{ExternalExtractor, GcodeExtractor};
    use std::sync::Arc as StdArc;

    fn make_watcher() -> ChangeWatcher {
        let roots = Arc::new(FileRootsManager::new());
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("gcode_metadata").unwrap();
        let (events, _rx) = EventBus::new();
        let extractor: StdArc<dyn GcodeExtractor> = StdArc::new(ExternalExtractor { script_path: PathBuf::from("/bin/true") });
        let metadata = MetadataCache::new(ns, PathBuf::from("/gcodes"), extractor, events.clone());
        ChangeWatcher::new(roots, metadata, events)
    }

    #[test]
    fn hidden_entries_are_ignored() {
        assert!(is_hidden(Path::new("/a/.git")));
        assert!(!is_hidden(Path::new("/a/file.gcode")));
    }

    #[tokio::test]
    async fn write_close_without_pending_entry_is_a_noop() {
        let watcher = make_watcher();
        watcher.on_write_close("gcodes", Path::new("/gcodes"), Path::new("/gcodes/a.gcode")).await;
        // No panic, no emitted event: nothing was pending for this path.
    }

    #[tokio::test]
    async fn moved_from_then_moved_to_with_same_cookie_emits_move() {
        let watcher = make_watcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.events.register_handler(
            "file_manager:move_file",
            Arc::new(move |args| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(args);
                })
            }),
        );
        watcher.on_moved_from(7, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/old.gcode")).await;
        watcher.on_moved_to(7, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/new.gcode")).await;
        let args = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(args[0]["path"], "new.gcode");
        assert_eq!(args[0]["source_path"], "old.gcode");
    }

    #[tokio::test]
    async fn moved_from_then_moved_to_for_watched_directory_emits_move_dir() {
        let watcher = make_watcher();
        watcher.inner.lock().await.watched_dirs.insert(PathBuf::from("/gcodes/old_dir"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.events.register_handler(
            "file_manager:move_dir",
            Arc::new(move |args| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(args);
                })
            }),
        );
        watcher.on_moved_from(11, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/old_dir")).await;
        watcher.on_moved_to(11, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/new_dir")).await;
        let args = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(args[0]["path"], "new_dir");
        assert_eq!(args[0]["source_path"], "old_dir");

        let inner = watcher.inner.lock().await;
        assert!(!inner.watched_dirs.contains(Path::new("/gcodes/old_dir")));
        assert!(inner.watched_dirs.contains(Path::new("/gcodes/new_dir")));
    }

    #[tokio::test]
    async fn unmatched_moved_from_for_watched_directory_expires_as_delete_dir() {
        let watcher = make_watcher();
        watcher.inner.lock().await.watched_dirs.insert(PathBuf::from("/gcodes/gone_dir"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.events.register_handler(
            "file_manager:delete_dir",
            Arc::new(move |args| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(args);
                })
            }),
        );
        watcher.on_moved_from(23, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/gone_dir")).await;
        let args = tokio::time::timeout(DIR_MOVE_TTL + Duration::from_millis(300), rx.recv()).await.unwrap().unwrap();
        assert_eq!(args[0]["path"], "gone_dir");
    }

    #[tokio::test]
    async fn unmatched_moved_to_behaves_as_create() {
        let watcher = make_watcher();
        watcher.on_moved_to(99, "gcodes", Path::new("/gcodes"), Path::new("/gcodes/fresh.gcode")).await;
        let inner = watcher.inner.lock().await;
        assert!(inner.created.contains_key(Path::new("/gcodes/fresh.gcode")));
    }

    #[tokio::test]
    async fn delete_batch_coalesces_multiple_files_in_one_directory() {
        let watcher = make_watcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.events.register_handler(
            "file_manager:delete_file",
            Arc::new(move |args| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(args);
                })
            }),
        );
        watcher.on_file_removed("gcodes", Path::new("/gcodes"), Path::new("/gcodes/a.gcode")).await;
        watcher.on_file_removed("gcodes", Path::new("/gcodes"), Path::new("/gcodes/b.gcode")).await;
        let mut seen = Vec::new();
        for _ in 0..2 {
            let args = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.unwrap().unwrap();
            seen.push(args[0]["path"].as_str().unwrap().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["a.gcode".to_string(), "b.gcode".to_string()]);
    }
}
