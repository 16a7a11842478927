//! Path validation for every file the pipeline touches.
//!
//! A [`PathGuard`] is anchored at a canonical root directory. Names handed to it
//! are untrusted: they are checked lexically, joined under the root, and the
//! result is canonicalized again so symlinks cannot carry a path outside. The
//! returned [`GuardedPath`] remembers what it saw (entry class and inode) so the
//! guard can re-check it right before a destructive operation.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use crate::error::PathViolation;

/// Characters that render like `.`, `/` or `\` in many fonts.
const LOOKALIKES: &[char] = &[
    '\u{2024}', // one dot leader
    '\u{FE52}', // small full stop
    '\u{FF0E}', // fullwidth full stop
    '\u{2215}', // division slash
    '\u{2044}', // fraction slash
    '\u{29F8}', // big solidus
    '\u{FF0F}', // fullwidth solidus
    '\u{29F5}', // reverse solidus operator
    '\u{FE68}', // small reverse solidus
    '\u{FF3C}', // fullwidth reverse solidus
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Missing,
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryClass {
    fn of(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            EntryClass::Symlink
        } else if file_type.is_file() {
            EntryClass::File
        } else if file_type.is_dir() {
            EntryClass::Dir
        } else {
            EntryClass::Other
        }
    }
}

/// A canonical path that was proven to live inside a guard's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedPath {
    path: PathBuf,
    class: EntryClass,
    identity: Option<(u64, u64)>,
}

impl GuardedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> EntryClass {
        self.class
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

impl AsRef<Path> for GuardedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathViolation> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root).map_err(|err| PathViolation::BadRoot {
            root: root.to_path_buf(),
            reason: err.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(PathViolation::BadRoot {
                root: root.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a name that must already exist under the root.
    pub fn resolve(&self, name: &str) -> Result<GuardedPath, PathViolation> {
        let guarded = self.resolve_new(name)?;
        if guarded.class == EntryClass::Missing {
            return Err(PathViolation::Missing(guarded.path));
        }
        Ok(guarded)
    }

    /// Resolve a name whose final component may not exist yet.
    pub fn resolve_new(&self, name: &str) -> Result<GuardedPath, PathViolation> {
        let relative = lexical_relative(name)?;
        let joined = self.root.join(&relative);
        let (Some(parent), Some(file_name)) = (joined.parent(), joined.file_name()) else {
            return Err(PathViolation::Traversal(name.to_string()));
        };
        let parent = self.canonical_parent(parent)?;
        self.classify(parent.join(file_name))
    }

    /// Resolve a name and require it to be an existing regular file.
    pub fn resolve_file(&self, name: &str) -> Result<GuardedPath, PathViolation> {
        let guarded = self.resolve(name)?;
        if guarded.class != EntryClass::File {
            return Err(PathViolation::NotAFile(guarded.path));
        }
        Ok(guarded)
    }

    /// Re-stat a previously resolved path and confirm nothing was swapped under it.
    pub fn revalidate(&self, guarded: &GuardedPath) -> Result<(), PathViolation> {
        let (class, identity) = match fs::symlink_metadata(&guarded.path) {
            Ok(meta) => (EntryClass::of(&meta), identity_of(&meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (EntryClass::Missing, None),
            Err(_) => return Err(PathViolation::Changed(guarded.path.clone())),
        };
        if class != guarded.class || identity != guarded.identity {
            return Err(PathViolation::Changed(guarded.path.clone()));
        }
        self.confirm_parent(&guarded.path)
    }

    /// Pick up a legitimate mutation (a tool wrote the file) and demand a plain file.
    pub fn observe(&self, guarded: &GuardedPath) -> Result<GuardedPath, PathViolation> {
        self.confirm_parent(&guarded.path)?;
        let meta = match fs::symlink_metadata(&guarded.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PathViolation::Missing(guarded.path.clone()));
            }
            Err(_) => return Err(PathViolation::Changed(guarded.path.clone())),
        };
        match EntryClass::of(&meta) {
            EntryClass::File => Ok(GuardedPath {
                path: guarded.path.clone(),
                class: EntryClass::File,
                identity: identity_of(&meta),
            }),
            EntryClass::Symlink => Err(PathViolation::SymlinkEscape(guarded.path.clone())),
            _ => Err(PathViolation::NotAFile(guarded.path.clone())),
        }
    }

    fn canonical_parent(&self, parent: &Path) -> Result<PathBuf, PathViolation> {
        let canonical = fs::canonicalize(parent).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                PathViolation::Missing(parent.to_path_buf())
            } else {
                PathViolation::EscapesRoot(parent.to_path_buf())
            }
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(PathViolation::EscapesRoot(canonical));
        }
        Ok(canonical)
    }

    fn confirm_parent(&self, path: &Path) -> Result<(), PathViolation> {
        let Some(parent) = path.parent() else {
            return Err(PathViolation::Changed(path.to_path_buf()));
        };
        match fs::canonicalize(parent) {
            Ok(canonical) if canonical == parent && canonical.starts_with(&self.root) => Ok(()),
            _ => Err(PathViolation::Changed(path.to_path_buf())),
        }
    }

    fn classify(&self, candidate: PathBuf) -> Result<GuardedPath, PathViolation> {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(GuardedPath {
                    path: candidate,
                    class: EntryClass::Missing,
                    identity: None,
                });
            }
            Err(_) => return Err(PathViolation::Missing(candidate)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(GuardedPath {
                path: candidate,
                class: EntryClass::of(&meta),
                identity: identity_of(&meta),
            });
        }

        // Dangling links fail canonicalization and count as escapes.
        let target = fs::canonicalize(&candidate)
            .map_err(|_| PathViolation::SymlinkEscape(candidate.clone()))?;
        if !target.starts_with(&self.root) || target == self.root {
            return Err(PathViolation::SymlinkEscape(candidate));
        }
        let target_meta = fs::symlink_metadata(&target)
            .map_err(|_| PathViolation::SymlinkEscape(candidate.clone()))?;
        Ok(GuardedPath {
            path: target,
            class: EntryClass::of(&target_meta),
            identity: identity_of(&target_meta),
        })
    }
}

fn lexical_relative(name: &str) -> Result<PathBuf, PathViolation> {
    if name.is_empty() {
        return Err(PathViolation::Empty);
    }
    if name
        .chars()
        .any(|c| c.is_control() || c == '\\' || LOOKALIKES.contains(&c))
    {
        return Err(PathViolation::InvalidName(name.escape_debug().to_string()));
    }

    let path = Path::new(name);
    if path.is_absolute() || name.starts_with('/') {
        return Err(PathViolation::Absolute(name.to_string()));
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathViolation::Traversal(name.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathViolation::Absolute(name.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(PathViolation::Traversal(name.to_string()));
    }
    Ok(parts.iter().collect())
}

#[cfg(unix)]
fn identity_of(meta: &Metadata) -> Option<(u64, u64)> {
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn identity_of(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}
