//! Validate-then-rename publication of finished artifacts.
//!
//! Nothing becomes visible at a final name until a full copy has been written
//! next to it, flushed, and validated as GLB. The final rename is atomic, so
//! readers see either the previous artifact or the new one, never a mixture.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, info};

use crate::digest::sha256_bytes;
use crate::error::{PathViolation, PublishError};
use crate::glb::{self, GlbSummary, SizeBounds};
use crate::guard::{EntryClass, GuardedPath, PathGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct AtomicPublisher {
    guard: PathGuard,
    bounds: SizeBounds,
}

impl AtomicPublisher {
    pub fn new(output_dir: impl AsRef<Path>, bounds: SizeBounds) -> Result<Self, PublishError> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)?;
        Ok(Self {
            guard: PathGuard::new(output_dir)?,
            bounds,
        })
    }

    pub fn output_root(&self) -> &Path {
        self.guard.root()
    }

    /// Copy `candidate` beside `final_name` and validate the copy.
    ///
    /// The returned candidate holds an exclusive temporary file; dropping it
    /// without [`PublishCandidate::commit`] removes the temporary and leaves the
    /// final name untouched.
    pub fn stage(
        &self,
        candidate: &Path,
        final_name: &str,
    ) -> Result<PublishCandidate<'_>, PublishError> {
        self.ensure_parent(final_name)?;
        let target = self.target(final_name)?;
        let parent = target
            .as_path()
            .parent()
            .ok_or_else(|| PathViolation::Traversal(final_name.to_string()))?;
        let base = target.file_name().unwrap_or("artifact");

        let bytes = glb::read_bounded(candidate, self.bounds.max)?;
        let mut temp = Builder::new()
            .prefix(&format!(".{base}."))
            .suffix(".tmp")
            .tempfile_in(parent)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;

        let summary = glb::validate_file(temp.path(), self.bounds)?;
        debug!(
            target = %target.as_path().display(),
            size = bytes.len(),
            "Staged candidate passed validation"
        );
        Ok(PublishCandidate {
            publisher: self,
            temp,
            target,
            summary,
            size: bytes.len() as u64,
            sha256: sha256_bytes(&bytes),
        })
    }

    pub fn publish(
        &self,
        candidate: &Path,
        final_name: &str,
    ) -> Result<PublishedArtifact, PublishError> {
        self.stage(candidate, final_name)?.commit()
    }

    /// Remove a previously published artifact; used to roll back partial sets.
    pub fn withdraw(&self, artifact: &PublishedArtifact) -> Result<(), PublishError> {
        let relative = artifact
            .path
            .strip_prefix(self.guard.root())
            .map_err(|_| PathViolation::EscapesRoot(artifact.path.clone()))?;
        let name = relative.to_string_lossy();
        let target = self.guard.resolve_new(&name)?;
        if target.class() == EntryClass::File {
            fs::remove_file(target.as_path())?;
            sync_dir(target.as_path())?;
        }
        Ok(())
    }

    fn target(&self, final_name: &str) -> Result<GuardedPath, PathViolation> {
        let target = self.guard.resolve_new(final_name)?;
        let requested = Path::new(final_name).file_name();
        if requested.is_some() && target.as_path().file_name() != requested {
            // The guard followed a link; refuse to write through it.
            return Err(PathViolation::SymlinkEscape(target.as_path().to_path_buf()));
        }
        match target.class() {
            EntryClass::Missing | EntryClass::File => Ok(target),
            _ => Err(PathViolation::NotAFile(target.as_path().to_path_buf())),
        }
    }

    /// Create intermediate directories one guarded component at a time.
    fn ensure_parent(&self, final_name: &str) -> Result<(), PublishError> {
        let Some(parent) = Path::new(final_name).parent() else {
            return Ok(());
        };
        let mut prefix = PathBuf::new();
        for component in parent.components() {
            let Component::Normal(part) = component else {
                continue;
            };
            prefix.push(part);
            let dir = self.guard.resolve_new(&prefix.to_string_lossy())?;
            match dir.class() {
                EntryClass::Dir => {}
                EntryClass::Missing => fs::create_dir(dir.as_path())?,
                _ => return Err(PathViolation::NotAFile(dir.as_path().to_path_buf()).into()),
            }
        }
        Ok(())
    }
}

/// A validated copy waiting for its final rename.
#[derive(Debug)]
pub struct PublishCandidate<'a> {
    publisher: &'a AtomicPublisher,
    temp: NamedTempFile,
    target: GuardedPath,
    summary: GlbSummary,
    size: u64,
    sha256: String,
}

impl<'a> PublishCandidate<'a> {
    pub fn target(&self) -> &Path {
        self.target.as_path()
    }

    pub fn summary(&self) -> &GlbSummary {
        &self.summary
    }

    /// Atomically move the staged copy into place.
    pub fn commit(self) -> Result<PublishedArtifact, PublishError> {
        Ok(self.persist(false)?.keep())
    }

    /// Like [`commit`](Self::commit), but first copies whatever the final name
    /// held so that [`RevertibleCommit::revert`] can put it back.
    pub fn commit_revertible(self) -> Result<RevertibleCommit<'a>, PublishError> {
        self.persist(true)
    }

    fn persist(self, keep_previous: bool) -> Result<RevertibleCommit<'a>, PublishError> {
        let name = self
            .target
            .as_path()
            .strip_prefix(self.publisher.guard.root())
            .map_err(|_| PathViolation::EscapesRoot(self.target.as_path().to_path_buf()))?
            .to_string_lossy()
            .into_owned();
        let current = self.publisher.target(&name)?;
        if current.as_path() != self.target.as_path() {
            return Err(PathViolation::Changed(self.target.as_path().to_path_buf()).into());
        }

        let path = self.target.as_path().to_path_buf();
        let previous = match current.class() {
            EntryClass::File if keep_previous => Some(snapshot(&path)?),
            _ => None,
        };
        self.temp.persist(&path).map_err(|err| err.error)?;
        sync_dir(&path)?;
        info!(
            path = %path.display(),
            size = self.size,
            sha256 = self.sha256.as_str(),
            replaced = previous.is_some(),
            "Published artifact"
        );
        Ok(RevertibleCommit {
            publisher: self.publisher,
            artifact: PublishedArtifact {
                path,
                size: self.size,
                sha256: self.sha256,
            },
            previous,
        })
    }
}

/// A committed artifact that can still be rolled back to what it replaced.
///
/// Dropping it (or calling [`keep`](Self::keep)) discards the saved copy.
#[derive(Debug)]
pub struct RevertibleCommit<'a> {
    publisher: &'a AtomicPublisher,
    artifact: PublishedArtifact,
    previous: Option<TempPath>,
}

impl RevertibleCommit<'_> {
    pub fn artifact(&self) -> &PublishedArtifact {
        &self.artifact
    }

    pub fn keep(self) -> PublishedArtifact {
        self.artifact
    }

    /// Restore the file this commit replaced, or remove the artifact if the
    /// name was free before.
    pub fn revert(self) -> Result<(), PublishError> {
        match self.previous {
            Some(previous) => {
                previous
                    .persist(&self.artifact.path)
                    .map_err(|err| err.error)?;
                sync_dir(&self.artifact.path)?;
                debug!(path = %self.artifact.path.display(), "Restored previous artifact");
                Ok(())
            }
            None => self.publisher.withdraw(&self.artifact),
        }
    }
}

/// Copy `path` to a hidden sibling that is deleted on drop.
fn snapshot(path: &Path) -> Result<TempPath, PublishError> {
    let parent = path
        .parent()
        .ok_or_else(|| PathViolation::Traversal(path.display().to_string()))?;
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".into());
    let mut backup = Builder::new()
        .prefix(&format!(".{base}."))
        .suffix(".bak")
        .tempfile_in(parent)?;
    io::copy(&mut File::open(path)?, backup.as_file_mut())?;
    backup.as_file().sync_all()?;
    Ok(backup.into_temp_path())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
