//! File-roots manager: registered roots, path validation, listings,
//! move/copy semantics (spec §4.10).
//!
//! Ported from `components/file_manager.py::FileManager`'s path-handling
//! surface (`register_directory`, `_convert_request_path`,
//! `_list_directory`, `_handle_file_move_copy`, `_handle_operation_check`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::GatewayError;
use crate::files::metadata::MetadataCache;

/// Extensions recognized as gcode files; only these are surfaced in
/// extended listings and watched for metadata extraction.
pub const VALID_GCODE_EXTS: &[&str] = &[".gcode", ".g", ".gco", ".ufp", ".nc"];

/// Only these root names may be registered read-write (spec §3).
pub const FULL_ACCESS_ROOTS: &[&str] = &["gcodes", "config"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl AccessMode {
    pub fn for_root(name: &str) -> Self {
        if FULL_ACCESS_ROOTS.contains(&name) {
            Self::ReadWrite
        } else {
            Self::Read
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

#[derive(Debug, Clone)]
pub struct FileRoot {
    pub name: String,
    pub path: PathBuf,
    pub access: AccessMode,
}

/// Queries whether a path is currently loaded for printing. Implemented
/// by the host session in the server crate; kept as a trait here so the
/// file-roots manager doesn't depend on the host module directly.
#[async_trait]
pub trait PrintStatusProvider: Send + Sync {
    /// Returns `(loaded_file_absolute_path, is_active)` if the host is
    /// reachable, or `None` if it is not — in which case callers must
    /// skip the guard rather than block the operation (spec §4.10).
    async fn current_print(&self) -> Option<(PathBuf, bool)>;
}

pub struct NoHostSession;

#[async_trait]
impl PrintStatusProvider for NoHostSession {
    async fn current_print(&self) -> Option<(PathBuf, bool)> {
        None
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct PathInfo {
    pub modified: f64,
    pub size: u64,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Clone)]
pub struct DirEntryInfo {
    #[serde(flatten)]
    pub info: PathInfo,
    pub dirname: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Serialize)]
pub struct DirectoryListing {
    pub dirs: Vec<DirEntryInfo>,
    pub files: Vec<DirEntryInfo>,
    pub disk_usage: DiskUsage,
}

/// Named roots, path translation, and listings. Roots are keyed by name;
/// re-registering a name replaces the previous path (spec §3 idempotence
/// tested in §8).
pub struct FileRootsManager {
    roots: parking_lot::RwLock<std::collections::HashMap<String, FileRoot>>,
}

impl Default for FileRootsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRootsManager {
    pub fn new() -> Self {
        Self { roots: parking_lot::RwLock::new(std::collections::HashMap::new()) }
    }

    /// Resolves symlinks, verifies directory existence/access, and
    /// registers the root. Returns `Ok(true)` if this changed the
    /// registration (new root or different path), `Ok(false)` if the
    /// identical path was already registered (idempotent no-op, spec §8).
    pub async fn register_directory(&self, name: &str, path: impl AsRef<Path>) -> Result<bool, GatewayError> {
        let resolved = resolve_directory(path.as_ref()).await?;
        let access = AccessMode::for_root(name);

        {
            let existing = self.roots.read();
            if let Some(existing) = existing.get(name) {
                if existing.path == resolved {
                    return Ok(false);
                }
            }
        }

        self.roots.write().insert(
            name.to_string(),
            FileRoot { name: name.to_string(), path: resolved, access },
        );
        Ok(true)
    }

    pub fn root(&self, name: &str) -> Option<FileRoot> {
        self.roots.read().get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.roots.read().keys().cloned().collect()
    }

    /// Translates a client-facing path like `<root>/<relative...>` into
    /// `(root_name, disk_path)`, rejecting any path that would escape
    /// the root.
    pub fn convert_request_path(&self, request_path: &str) -> Result<(FileRoot, PathBuf), GatewayError> {
        let trimmed = request_path.trim_matches('/');
        let mut parts = trimmed.splitn(2, '/');
        let root_name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            GatewayError::bad_request(format!("Invalid path: {request_path}"))
        })?;
        let root = self
            .root(root_name)
            .ok_or_else(|| GatewayError::bad_request(format!("Invalid root path ({root_name})")))?;

        let disk_path = match parts.next() {
            Some(rest) if !rest.is_empty() => root.path.join(rest),
            _ => root.path.clone(),
        };
        let disk_path = normalize_lexically(&disk_path);
        if !disk_path.starts_with(&root.path) {
            return Err(GatewayError::forbidden(format!("Path escapes root: {request_path}")));
        }
        Ok((root, disk_path))
    }

    /// Directory listing with optional gcode-metadata merge for
    /// extended `gcodes` listings (spec §4.10).
    pub async fn list_directory(
        &self,
        dir_path: &Path,
        gcodes_root: Option<&Path>,
        extended: bool,
        metadata: Option<&MetadataCache>,
    ) -> Result<DirectoryListing, GatewayError> {
        if !tokio::fs::metadata(dir_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(GatewayError::not_found(format!("Directory does not exist ({})", dir_path.display())));
        }

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let full_path = entry.path();
            let Ok(meta) = tokio::fs::metadata(&full_path).await else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            let info = path_info(&meta);

            if meta.is_dir() {
                dirs.push(DirEntryInfo { info, dirname: Some(name), filename: None });
            } else if meta.is_file() {
                let mut info = info;
                let ext = extension_lower(&name);
                if extended {
                    if let (Some(gc_root), Some(cache)) = (gcodes_root, metadata) {
                        if full_path.starts_with(gc_root) && VALID_GCODE_EXTS.contains(&ext.as_str()) {
                            if let Ok(rel) = full_path.strip_prefix(gc_root) {
                                if let Some(record) = cache.get(&rel.to_string_lossy()) {
                                    info.metadata = record;
                                }
                            }
                        }
                    }
                }
                files.push(DirEntryInfo { info, dirname: None, filename: Some(name) });
            }
        }

        let usage = disk_usage(dir_path)?;
        Ok(DirectoryListing { dirs, files, disk_usage: usage })
    }

    /// `create=true` performs `mkdir`; used by the `POST` directory
    /// endpoint. Only valid for read-write roots.
    pub async fn create_directory(&self, root: &FileRoot, dir_path: &Path) -> Result<(), GatewayError> {
        require_write(root)?;
        tokio::fs::create_dir(dir_path).await?;
        Ok(())
    }

    /// Removes a directory. `force=true` recurses after checking the
    /// in-use guard; otherwise requires the directory to be empty.
    pub async fn delete_directory(
        &self,
        root: &FileRoot,
        dir_path: &Path,
        force: bool,
        guard: &dyn PrintStatusProvider,
    ) -> Result<(), GatewayError> {
        require_write(root)?;
        if dir_path == root.path {
            return Err(GatewayError::bad_request("Cannot delete root directory"));
        }
        if !tokio::fs::metadata(dir_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(GatewayError::bad_request(format!("Directory does not exist ({})", dir_path.display())));
        }
        if force {
            check_operation(dir_path, guard).await?;
            tokio::fs::remove_dir_all(dir_path).await?;
        } else {
            tokio::fs::remove_dir(dir_path).await?;
        }
        Ok(())
    }

    /// Moves or copies `source_path` (already-resolved disk path) to
    /// `dest_path`. `is_move=true` additionally requires the source root
    /// to be read-write and checks its in-use guard (spec §4.10).
    pub async fn move_or_copy(
        &self,
        source_root: &FileRoot,
        source_path: &Path,
        dest_root: &FileRoot,
        dest_path: &Path,
        is_move: bool,
        guard: &dyn PrintStatusProvider,
    ) -> Result<(), GatewayError> {
        require_write(dest_root)?;
        if tokio::fs::metadata(source_path).await.is_err() {
            return Err(GatewayError::bad_request(format!("File {} does not exist", source_path.display())));
        }
        if tokio::fs::metadata(dest_path).await.is_ok() {
            check_operation(dest_path, guard).await?;
        }

        if is_move {
            require_write(source_root)?;
            check_operation(source_path, guard).await?;
            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::rename(source_path, dest_path).await.is_err() {
                copy_recursive(source_path, dest_path).await?;
                remove_path(source_path).await?;
            }
        } else {
            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            copy_recursive(source_path, dest_path).await?;
        }
        Ok(())
    }

    /// Deletes a single file under a read-write root, checking the
    /// in-use guard for `gcodes` (spec §4.10, `delete_file`).
    pub async fn delete_file(
        &self,
        root: &FileRoot,
        file_path: &Path,
        guard: &dyn PrintStatusProvider,
    ) -> Result<(), GatewayError> {
        require_write(root)?;
        if !tokio::fs::metadata(file_path).await.map(|m| m.is_file()).unwrap_or(false) {
            return Err(GatewayError::bad_request(format!("Invalid file path: {}", file_path.display())));
        }
        if root.name == "gcodes" {
            check_operation(file_path, guard).await?;
        }
        tokio::fs::remove_file(file_path).await?;
        Ok(())
    }
}

fn require_write(root: &FileRoot) -> Result<(), GatewayError> {
    if root.access.is_write() {
        Ok(())
    } else {
        Err(GatewayError::forbidden(format!("Destination path is read-only: {}", root.name)))
    }
}

/// Checks whether `path` is currently loaded for printing; raises 403 if
/// so. An unreachable host session (`None`) skips the guard per spec
/// §4.10 — upload-time checks may proceed but won't auto-start a print.
async fn check_operation(path: &Path, guard: &dyn PrintStatusProvider) -> Result<(), GatewayError> {
    let Some((loaded_path, active)) = guard.current_print().await else { return Ok(()) };
    if !active {
        return Ok(());
    }
    let in_use = if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        loaded_path.starts_with(path)
    } else {
        loaded_path == path
    };
    if in_use {
        return Err(GatewayError::forbidden("File currently in use"));
    }
    Ok(())
}

async fn resolve_directory(path: &Path) -> Result<PathBuf, GatewayError> {
    let resolved = match tokio::fs::canonicalize(path).await {
        Ok(p) => p,
        Err(_) => path.to_path_buf(),
    };
    let meta = tokio::fs::metadata(&resolved).await?;
    if !meta.is_dir() || resolved == Path::new("/") {
        return Err(GatewayError::configuration(format!(
            "Supplied path ({}) is not a valid directory",
            resolved.display()
        )));
    }
    Ok(resolved)
}

fn path_info(meta: &std::fs::Metadata) -> PathInfo {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    PathInfo { modified, size: meta.len(), metadata: BTreeMap::new() }
}

fn extension_lower(name: &str) -> String {
    Path::new(name).extension().map(|e| format!(".{}", e.to_string_lossy().to_lowercase())).unwrap_or_default()
}

/// Lexical `..`/`.` normalization without touching the filesystem
/// (`canonicalize` would fail on paths whose final component doesn't
/// exist yet, e.g. an upload destination).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn disk_usage(path: &Path) -> Result<DiskUsage, GatewayError> {
    #[cfg(unix)]
    {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| GatewayError::io(format!("statvfs: {e}")))?;
        let block = stat.fragment_size();
        let total = stat.blocks() * block;
        let free = stat.blocks_available() * block;
        Ok(DiskUsage { total, used: total.saturating_sub(free), free })
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(DiskUsage { total: 0, used: 0, free: 0 })
    }
}

async fn copy_recursive(source: &Path, dest: &Path) -> Result<(), GatewayError> {
    let meta = tokio::fs::metadata(source).await?;
    if meta.is_dir() {
        tokio::fs::create_dir_all(dest).await?;
        for entry in walkdir::WalkDir::new(source).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| GatewayError::io(e.to_string()))?;
            let rel = entry.path().strip_prefix(source).expect("walkdir yields children of source");
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    } else {
        tokio::fs::copy(source, dest).await?;
    }
    Ok(())
}

async fn remove_path(path: &Path) -> Result<(), GatewayError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_directory_is_idempotent_for_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileRootsManager::new();
        assert!(manager.register_directory("gcodes", dir.path()).await.unwrap());
        assert!(!manager.register_directory("gcodes", dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn register_directory_replaces_on_different_path() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let manager = FileRootsManager::new();
        manager.register_directory("gcodes", dir1.path()).await.unwrap();
        assert!(manager.register_directory("gcodes", dir2.path()).await.unwrap());
        assert_eq!(manager.root("gcodes").unwrap().path, tokio::fs::canonicalize(dir2.path()).await.unwrap());
    }

    #[tokio::test]
    async fn only_gcodes_and_config_get_write_access() {
        assert_eq!(AccessMode::for_root("gcodes"), AccessMode::ReadWrite);
        assert_eq!(AccessMode::for_root("config"), AccessMode::ReadWrite);
        assert_eq!(AccessMode::for_root("docs"), AccessMode::Read);
    }

    #[tokio::test]
    async fn convert_request_path_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileRootsManager::new();
        manager.register_directory("gcodes", dir.path()).await.unwrap();
        let result = manager.convert_request_path("gcodes/../../etc/passwd");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn convert_request_path_resolves_relative_subpath() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileRootsManager::new();
        manager.register_directory("gcodes", dir.path()).await.unwrap();
        let (root, disk_path) = manager.convert_request_path("gcodes/job/a.gcode").unwrap();
        assert_eq!(root.name, "gcodes");
        assert!(disk_path.ends_with("job/a.gcode"));
    }

    #[tokio::test]
    async fn unknown_root_is_rejected() {
        let manager = FileRootsManager::new();
        assert!(manager.convert_request_path("nope/file.gcode").is_err());
    }

    #[tokio::test]
    async fn move_requires_writable_destination() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(src_dir.path().join("a.gcode"), b"data").await.unwrap();
        let manager = FileRootsManager::new();
        manager.register_directory("gcodes", src_dir.path()).await.unwrap();
        manager.register_directory("docs", dst_dir.path()).await.unwrap();
        let source_root = manager.root("gcodes").unwrap();
        let dest_root = manager.root("docs").unwrap();
        let result = manager
            .move_or_copy(
                &source_root,
                &src_dir.path().join("a.gcode"),
                &dest_root,
                &dst_dir.path().join("a.gcode"),
                true,
                &NoHostSession,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn move_succeeds_between_writable_roots() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(src_dir.path().join("a.gcode"), b"data").await.unwrap();
        let manager = FileRootsManager::new();
        manager.register_directory("gcodes", src_dir.path()).await.unwrap();
        manager.register_directory("config", dst_dir.path()).await.unwrap();
        let source_root = manager.root("gcodes").unwrap();
        let dest_root = manager.root("config").unwrap();
        manager
            .move_or_copy(
                &source_root,
                &src_dir.path().join("a.gcode"),
                &dest_root,
                &dst_dir.path().join("a.gcode"),
                true,
                &NoHostSession,
            )
            .await
            .unwrap();
        assert!(dst_dir.path().join("a.gcode").exists());
        assert!(!src_dir.path().join("a.gcode").exists());
    }
}
