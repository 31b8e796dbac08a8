/*
src/catalog.rs

The share catalog is derived on demand: every file-list request re-enumerates
the shared folder, so files added or removed while the node runs are
reflected without a restart. Hidden files and platform junk are never
advertised, and the server refuses names that could escape the folder.
*/

use std::io;
use std::path::{Path, PathBuf};

/// Names the directory whose regular-file children are advertised to peers.
/// Read-only from the node's point of view.
pub trait SharedFolder: Send + Sync {
    fn shared_dir(&self) -> PathBuf;
}

/// A share folder fixed at startup.
#[derive(Debug, Clone)]
pub struct FixedFolder {
    dir: PathBuf,
}

impl FixedFolder {
    pub fn new(dir: impl Into<PathBuf>) -> FixedFolder {
        FixedFolder { dir: dir.into() }
    }
}

impl SharedFolder for FixedFolder {
    fn shared_dir(&self) -> PathBuf {
        self.dir.clone()
    }
}

const JUNK_NAMES: &[&str] = &["Thumbs.db", "desktop.ini"];

/// True if the name may be advertised: not hidden, not platform junk.
pub fn is_advertised(name: &str) -> bool {
    !name.starts_with('.') && !JUNK_NAMES.contains(&name)
}

/// True if the name is advertisable and cannot address anything outside the
/// shared folder.
pub fn is_safe_name(name: &str) -> bool {
    is_advertised(name) && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Enumerates the advertised file names in `dir`, sorted for a stable
/// listing.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if is_advertised(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Resolves an advertised name to its path, or None if the name is unsafe or
/// does not name a regular file in `dir`.
pub fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    if !is_safe_name(name) {
        return None;
    }
    let path = dir.join(name);
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}
