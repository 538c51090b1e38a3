//! Metadata store — persistent mapping from virtual path to descriptor,
//! directory structure, and an ID-based sharded symlink index.
//!
//! Layout: `root/<virtual-dir>/<filename>.meta` holds the serialized
//! descriptor; an optional `<filename>.meta.id` sidecar holds the external
//! ID. `root/.ids/<c1>/<c2>/<c3>/<c4>/<c5>/<id>.meta` is a symlink to the
//! real `.meta` file for reverse lookup by external ID.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use prost::Message;

use crate::error::{ReaderError, Result};
use crate::meta::FileDescriptor;

const MAX_FILENAME_LEN: usize = 250;
const META_EXT: &str = ".meta";
const ID_EXT: &str = ".meta.id";
const IDS_DIR: &str = ".ids";
const CORRUPTED_DIR: &str = "corrupted_metadata";

/// Persistent descriptor storage plus directory and ID-index operations.
pub trait MetadataStore: Send + Sync {
    fn read_descriptor(&self, virtual_path: &str) -> Result<FileDescriptor>;
    fn write_descriptor(&self, virtual_path: &str, descriptor: &FileDescriptor) -> Result<()>;
    fn exists(&self, virtual_path: &str) -> bool;
    fn list_files(&self, virtual_dir: &str) -> Result<Vec<String>>;
    fn list_subdirs(&self, virtual_dir: &str) -> Result<Vec<String>>;
    fn walk_directory(&self, virtual_dir: &str) -> Result<Vec<String>>;
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;
    fn delete(&self, virtual_path: &str, cascade_delete_origin: bool) -> Result<()>;
    fn move_to_corrupted_quarantine(&self, virtual_path: &str) -> Result<()>;
    fn cleanup_empty_directories(&self) -> Result<()>;
    fn write_external_id(&self, virtual_path: &str, external_id: &str) -> Result<()>;
    fn resolve_external_id(&self, external_id: &str) -> Result<Option<String>>;
}

/// Filesystem-backed implementation.
pub struct FsMetadataStore {
    root: PathBuf,
    protected_dirs: HashSet<String>,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>, protected_dirs: Vec<String>) -> Self {
        Self { root: root.into(), protected_dirs: protected_dirs.into_iter().collect() }
    }

    fn meta_path(&self, virtual_path: &str) -> PathBuf {
        let (dir, filename) = split_virtual_path(virtual_path);
        let truncated = truncate_filename(&filename);
        self.root.join(dir).join(format!("{truncated}{META_EXT}"))
    }

    fn id_sidecar_path(&self, virtual_path: &str) -> PathBuf {
        let meta = self.meta_path(virtual_path);
        PathBuf::from(format!("{}.id", meta.display()))
    }

    fn id_shard_path(&self, external_id: &str) -> PathBuf {
        let lower = external_id.to_lowercase();
        let mut chars = lower.chars();
        let mut shard = self.root.join(IDS_DIR);
        for _ in 0..5 {
            let c = chars.next().unwrap_or('_');
            shard = shard.join(c.to_string());
        }
        shard.join(format!("{lower}{META_EXT}"))
    }
}

impl MetadataStore for FsMetadataStore {
    fn read_descriptor(&self, virtual_path: &str) -> Result<FileDescriptor> {
        let path = self.meta_path(virtual_path);
        let bytes = std::fs::read(&path)
            .map_err(|_| ReaderError::PathNotFound(virtual_path.to_string()))?;
        FileDescriptor::decode(bytes.as_slice())
            .map_err(|e| ReaderError::Metadata(format!("corrupt descriptor at {path:?}: {e}")))
    }

    fn write_descriptor(&self, virtual_path: &str, descriptor: &FileDescriptor) -> Result<()> {
        let path = self.meta_path(virtual_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ReaderError::Io)?;
        }
        let mut buf = Vec::new();
        descriptor
            .encode(&mut buf)
            .map_err(|e| ReaderError::Metadata(format!("encode failed: {e}")))?;
        std::fs::write(&path, buf).map_err(ReaderError::Io)?;

        if !descriptor.external_id.is_empty() {
            self.write_external_id(virtual_path, &descriptor.external_id)?;
        }
        Ok(())
    }

    fn exists(&self, virtual_path: &str) -> bool {
        self.meta_path(virtual_path).is_file()
    }

    fn list_files(&self, virtual_dir: &str) -> Result<Vec<String>> {
        let dir = self.root.join(virtual_dir.trim_start_matches('/'));
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ReaderError::Io(e)),
        };
        for entry in entries {
            let entry = entry.map_err(ReaderError::Io)?;
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if let Some(stripped) = name.strip_suffix(META_EXT) {
                        if !name.ends_with(ID_EXT) {
                            out.push(stripped.to_string());
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn list_subdirs(&self, virtual_dir: &str) -> Result<Vec<String>> {
        let dir = self.root.join(virtual_dir.trim_start_matches('/'));
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ReaderError::Io(e)),
        };
        for entry in entries {
            let entry = entry.map_err(ReaderError::Io)?;
            let path = entry.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name != IDS_DIR && name != CORRUPTED_DIR {
                        out.push(name.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    fn walk_directory(&self, virtual_dir: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        walk_recursive(&self.root, virtual_dir, &mut out)?;
        Ok(out)
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.meta_path(from);
        let to_path = self.meta_path(to);
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent).map_err(ReaderError::Io)?;
        }

        match std::fs::rename(&from_path, &to_path) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                std::fs::copy(&from_path, &to_path).map_err(ReaderError::Io)?;
                std::fs::remove_file(&from_path).map_err(ReaderError::Io)?;
            }
            Err(e) => return Err(ReaderError::Io(e)),
        }

        let from_id = self.id_sidecar_path(from);
        if from_id.is_file() {
            let to_id = self.id_sidecar_path(to);
            let _ = std::fs::rename(&from_id, &to_id);
        }
        Ok(())
    }

    fn delete(&self, virtual_path: &str, cascade_delete_origin: bool) -> Result<()> {
        let path = self.meta_path(virtual_path);
        if cascade_delete_origin {
            if let Ok(descriptor) = self.read_descriptor(virtual_path) {
                if !descriptor.origin_path.is_empty() {
                    let _ = std::fs::remove_file(&descriptor.origin_path);
                }
            }
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ReaderError::Io(e)),
        }
        let id_path = self.id_sidecar_path(virtual_path);
        let _ = std::fs::remove_file(&id_path);
        Ok(())
    }

    fn move_to_corrupted_quarantine(&self, virtual_path: &str) -> Result<()> {
        let from = self.meta_path(virtual_path);
        let (dir, filename) = split_virtual_path(virtual_path);
        let to = self.root.join(CORRUPTED_DIR).join(dir).join(format!(
            "{}{META_EXT}",
            truncate_filename(&filename)
        ));
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(ReaderError::Io)?;
        }
        match std::fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                std::fs::copy(&from, &to).map_err(ReaderError::Io)?;
                std::fs::remove_file(&from).map_err(ReaderError::Io)?;
                Ok(())
            }
            Err(e) => Err(ReaderError::Io(e)),
        }
    }

    fn cleanup_empty_directories(&self) -> Result<()> {
        cleanup_recursive(&self.root, &self.root, &self.protected_dirs)?;
        Ok(())
    }

    fn write_external_id(&self, virtual_path: &str, external_id: &str) -> Result<()> {
        let id_path = self.id_sidecar_path(virtual_path);
        if let Some(parent) = id_path.parent() {
            std::fs::create_dir_all(parent).map_err(ReaderError::Io)?;
        }
        std::fs::write(&id_path, external_id.as_bytes()).map_err(ReaderError::Io)?;

        let shard_path = self.id_shard_path(external_id);
        if let Some(parent) = shard_path.parent() {
            std::fs::create_dir_all(parent).map_err(ReaderError::Io)?;
        }
        let _ = std::fs::remove_file(&shard_path);
        let meta_path = self.meta_path(virtual_path);
        #[cfg(unix)]
        std::os::unix::fs::symlink(&meta_path, &shard_path).map_err(ReaderError::Io)?;
        #[cfg(not(unix))]
        std::fs::write(&shard_path, meta_path.to_string_lossy().as_bytes())
            .map_err(ReaderError::Io)?;
        Ok(())
    }

    fn resolve_external_id(&self, external_id: &str) -> Result<Option<String>> {
        let shard_path = self.id_shard_path(external_id);
        let target = match std::fs::read_link(&shard_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReaderError::Io(e)),
        };
        Ok(Some(meta_path_to_virtual_path(&self.root, &target)))
    }
}

/// Strip a leading `.ids/` path prefix and resolve through the symlink to
/// the virtual path, by stripping the store root and the `.meta` suffix.
fn meta_path_to_virtual_path(root: &Path, meta_path: &Path) -> String {
    let relative = meta_path.strip_prefix(root).unwrap_or(meta_path);
    let s = relative.to_string_lossy().replace('\\', "/");
    s.strip_suffix(META_EXT).unwrap_or(&s).to_string()
}

fn split_virtual_path(virtual_path: &str) -> (String, String) {
    let trimmed = virtual_path.trim_start_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, file)) => (dir.to_string(), file.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

fn truncate_filename(filename: &str) -> String {
    if filename.len() <= MAX_FILENAME_LEN {
        filename.to_string()
    } else {
        filename.chars().take(MAX_FILENAME_LEN).collect()
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc_exdev())
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV on Linux and most Unix targets
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    -1
}

fn walk_recursive(root: &Path, virtual_dir: &str, out: &mut Vec<String>) -> Result<()> {
    let dir = root.join(virtual_dir.trim_start_matches('/'));
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ReaderError::Io(e)),
    };
    for entry in entries {
        let entry = entry.map_err(ReaderError::Io)?;
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        if path.is_dir() {
            if name == IDS_DIR || name == CORRUPTED_DIR {
                continue;
            }
            let child_virtual = format!("{}/{}", virtual_dir.trim_end_matches('/'), name);
            walk_recursive(root, &child_virtual, out)?;
        } else if let Some(stripped) = name.strip_suffix(META_EXT) {
            if !name.ends_with(ID_EXT) {
                out.push(format!("{}/{}", virtual_dir.trim_end_matches('/'), stripped));
            }
        }
    }
    Ok(())
}

fn cleanup_recursive(root: &Path, dir: &Path, protected: &HashSet<String>) -> Result<bool> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(ReaderError::Io(e)),
    };

    let mut is_empty = true;
    for entry in entries {
        let entry = entry.map_err(ReaderError::Io)?;
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

        if path.is_dir() {
            if protected.contains(&name) && path.parent() == Some(root) {
                is_empty = false;
                continue;
            }
            let child_empty = cleanup_recursive(root, &path, protected)?;
            if child_empty {
                let _ = std::fs::remove_dir(&path);
            } else {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }
    Ok(is_empty && dir != root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(size: u64) -> FileDescriptor {
        FileDescriptor { size, ..Default::default() }
    }

    #[test]
    fn write_then_read_round_trips_the_descriptor() {
        let tmp = TempDir::new().unwrap();
        let store = FsMetadataStore::new(tmp.path(), vec![IDS_DIR.to_string()]);
        store.write_descriptor("movies/a.mkv", &descriptor(1234)).unwrap();
        let read_back = store.read_descriptor("movies/a.mkv").unwrap();
        assert_eq!(read_back.size, 1234);
        assert!(store.exists("movies/a.mkv"));
    }

    #[test]
    fn external_id_resolves_back_to_the_virtual_path() {
        let tmp = TempDir::new().unwrap();
        let store = FsMetadataStore::new(tmp.path(), vec![IDS_DIR.to_string()]);
        store.write_descriptor("movies/a.mkv", &descriptor(10)).unwrap();
        store.write_external_id("movies/a.mkv", "ABCDEFGH").unwrap();
        let resolved = store.resolve_external_id("ABCDEFGH").unwrap();
        assert_eq!(resolved.as_deref(), Some("movies/a.mkv"));
    }

    #[test]
    fn rename_moves_descriptor_and_id_sidecar() {
        let tmp = TempDir::new().unwrap();
        let store = FsMetadataStore::new(tmp.path(), vec![]);
        store.write_descriptor("a.mkv", &descriptor(1)).unwrap();
        store.write_external_id("a.mkv", "id1").unwrap();
        store.rename_file("a.mkv", "b.mkv").unwrap();
        assert!(!store.exists("a.mkv"));
        assert!(store.exists("b.mkv"));
        assert!(tmp.path().join("b.mkv.meta.id").is_file());
    }

    #[test]
    fn cleanup_empty_directories_removes_only_empty_leaves() {
        let tmp = TempDir::new().unwrap();
        let store = FsMetadataStore::new(tmp.path(), vec!["keep".to_string()]);
        std::fs::create_dir_all(tmp.path().join("empty/nested")).unwrap();
        std::fs::create_dir_all(tmp.path().join("keep")).unwrap();
        store.write_descriptor("has_file/x.mkv", &descriptor(1)).unwrap();

        store.cleanup_empty_directories().unwrap();

        assert!(!tmp.path().join("empty").exists());
        assert!(tmp.path().join("keep").exists());
        assert!(tmp.path().join("has_file").exists());
    }

    #[test]
    fn list_files_excludes_id_sidecars() {
        let tmp = TempDir::new().unwrap();
        let store = FsMetadataStore::new(tmp.path(), vec![]);
        store.write_descriptor("dir/a.mkv", &descriptor(1)).unwrap();
        store.write_external_id("dir/a.mkv", "id1").unwrap();
        let files = store.list_files("dir").unwrap();
        assert_eq!(files, vec!["a.mkv".to_string()]);
    }
}
