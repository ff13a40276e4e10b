// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! On-disk layout of the index and the moves between its generations.
//!
//! ```text
//! base/origin/           committed index + metadata.json
//! base/old/              previous generation (copy-on-write only)
//! base/broken/<nanos>/   quarantined generations, oldest evicted first
//! base/.tmp-<uuid>/      in-flight copy-on-write save
//! ```

use crate::core::types::now_nanos;
use crate::metadata;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ORIGIN_DIR_NAME: &str = "origin";
pub const OLD_DIR_NAME: &str = "old";
pub const BROKEN_DIR_NAME: &str = "broken";
const TMP_DIR_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to read directory {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub base: PathBuf,
    pub origin: PathBuf,
    pub old: PathBuf,
    pub broken: PathBuf,
    /// Flat layout used before generations were introduced; files lived
    /// directly under the base path.
    pub legacy: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            origin: base.join(ORIGIN_DIR_NAME),
            old: base.join(OLD_DIR_NAME),
            broken: base.join(BROKEN_DIR_NAME),
            legacy: base.clone(),
            base,
        }
    }
}

fn create_dir(path: &Path) -> Result<(), LifecycleError> {
    fs::create_dir_all(path).map_err(|source| LifecycleError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), LifecycleError> {
    fs::rename(from, to).map_err(|source| LifecycleError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

fn remove_dir(path: &Path) -> Result<(), LifecycleError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Entries of a directory; a missing directory is empty.
pub fn list_dir(path: &Path) -> Result<Vec<PathBuf>, LifecycleError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LifecycleError::ReadDir {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LifecycleError::ReadDir {
            path: path.to_path_buf(),
            source,
        })?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

/// Whether the contents of `path` are worth preserving if loading them fails.
///
/// Nothing there, or a valid descriptor for an empty index, needs no backup.
/// Files without a descriptor, an unreadable descriptor, an invalid marker,
/// or a non-zero object count all do.
pub fn needs_backup(path: &Path) -> bool {
    let entries = match list_dir(path) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    if entries.is_empty() {
        return false;
    }
    if !metadata::exists(path) {
        return true;
    }
    match metadata::load(path) {
        Ok(meta) => meta.is_invalid || meta.index_count > 0,
        Err(e) => {
            warn!("unreadable metadata in {}: {}", path.display(), e);
            true
        }
    }
}

pub struct DirectoryManager {
    paths: IndexPaths,
    copy_on_write: bool,
    history_limit: usize,
}

impl DirectoryManager {
    pub fn new<P: AsRef<Path>>(base: P, copy_on_write: bool, history_limit: usize) -> Self {
        Self {
            paths: IndexPaths::new(base),
            copy_on_write,
            history_limit,
        }
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    pub fn copy_on_write(&self) -> bool {
        self.copy_on_write
    }

    /// Creates the base layout, migrating a legacy flat layout first so an
    /// existing origin is never overwritten.
    pub fn prepare(&self) -> Result<(), LifecycleError> {
        create_dir(&self.paths.base)?;
        self.migrate_legacy()?;
        if self.copy_on_write {
            self.resume_interrupted_switch()?;
        }
        self.remove_stale_tmp()?;

        create_dir(&self.paths.origin)?;
        create_dir(&self.paths.broken)?;
        if self.copy_on_write {
            create_dir(&self.paths.old)?;
        }
        debug!("prepared index directories under {}", self.paths.base.display());
        Ok(())
    }

    /// Moves regular files found directly under the base path into origin.
    /// Returns how many files moved; skipped entirely once origin exists.
    pub fn migrate_legacy(&self) -> Result<usize, LifecycleError> {
        if self.paths.origin.exists() {
            return Ok(0);
        }

        let files: Vec<PathBuf> = list_dir(&self.paths.legacy)?
            .into_iter()
            .filter(|p| p.is_file())
            .collect();
        if files.is_empty() {
            return Ok(0);
        }

        create_dir(&self.paths.origin)?;
        for file in &files {
            if let Some(name) = file.file_name() {
                rename(file, &self.paths.origin.join(name))?;
            }
        }
        info!(
            "migrated {} legacy index files into {}",
            files.len(),
            self.paths.origin.display()
        );
        Ok(files.len())
    }

    fn tmp_dirs(&self) -> Result<Vec<PathBuf>, LifecycleError> {
        Ok(list_dir(&self.paths.base)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(TMP_DIR_PREFIX))
            })
            .collect())
    }

    /// Finishes a copy-on-write save that stopped between its two renames.
    ///
    /// Only applies while origin is missing. The most recently written tmp
    /// directory carrying a valid descriptor becomes origin; without one,
    /// origin stays missing and recovery falls back to the previous
    /// generation. Returns the directory published, if any.
    pub fn resume_interrupted_switch(&self) -> Result<Option<PathBuf>, LifecycleError> {
        if self.paths.origin.exists() {
            return Ok(None);
        }

        let mut completed: Vec<(SystemTime, PathBuf)> = self
            .tmp_dirs()?
            .into_iter()
            .filter(|tmp| matches!(metadata::load(tmp), Ok(meta) if !meta.is_invalid))
            .map(|tmp| {
                let written = fs::metadata(metadata::path_in(&tmp))
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (written, tmp)
            })
            .collect();
        completed.sort();

        match completed.pop() {
            Some((_, tmp)) => {
                rename(&tmp, &self.paths.origin)?;
                warn!(
                    "origin was missing, published completed save {} as {}",
                    tmp.display(),
                    self.paths.origin.display()
                );
                Ok(Some(tmp))
            }
            None => Ok(None),
        }
    }

    fn remove_stale_tmp(&self) -> Result<(), LifecycleError> {
        for entry in self.tmp_dirs()? {
            warn!("removing abandoned save directory {}", entry.display());
            remove_dir(&entry)?;
        }
        Ok(())
    }

    /// Generation directories in `broken`, oldest first.
    pub fn broken_generations(&self) -> Result<Vec<PathBuf>, LifecycleError> {
        let mut generations: Vec<(u128, PathBuf)> = list_dir(&self.paths.broken)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let stamp = p.file_name()?.to_str()?.parse::<u128>().ok()?;
                Some((stamp, p))
            })
            .collect();
        generations.sort_by_key(|(stamp, _)| *stamp);
        Ok(generations.into_iter().map(|(_, p)| p).collect())
    }

    pub fn broken_count(&self) -> usize {
        self.broken_generations().map(|g| g.len()).unwrap_or(0)
    }

    /// Moves the contents of `dir` into a fresh generation under `broken`
    /// and leaves `dir` empty. With a zero history limit the contents are
    /// discarded instead. Returns the generation created, if any.
    pub fn quarantine(&self, dir: &Path) -> Result<Option<PathBuf>, LifecycleError> {
        if list_dir(dir)?.is_empty() {
            return Ok(None);
        }

        if self.history_limit == 0 {
            warn!(
                "broken index history is disabled, discarding {}",
                dir.display()
            );
            self.clear(dir)?;
            return Ok(None);
        }

        create_dir(&self.paths.broken)?;
        let mut stamp = now_nanos().max(0) as u128;
        let mut dest = self.paths.broken.join(stamp.to_string());
        while dest.exists() {
            stamp += 1;
            dest = self.paths.broken.join(stamp.to_string());
        }

        rename(dir, &dest)?;
        create_dir(dir)?;
        warn!("quarantined {} into {}", dir.display(), dest.display());

        let generations = self.broken_generations()?;
        let excess = generations.len().saturating_sub(self.history_limit);
        for oldest in generations.iter().take(excess) {
            info!("evicting broken generation {}", oldest.display());
            remove_dir(oldest)?;
        }
        Ok(Some(dest))
    }

    /// Removes everything inside `dir`, keeping the directory itself.
    pub fn clear(&self, dir: &Path) -> Result<(), LifecycleError> {
        remove_dir(dir)?;
        create_dir(dir)
    }

    /// Replaces the (empty) origin with the previous generation in one rename.
    pub fn promote_old(&self) -> Result<(), LifecycleError> {
        remove_dir(&self.paths.origin)?;
        rename(&self.paths.old, &self.paths.origin)?;
        create_dir(&self.paths.old)?;
        info!(
            "promoted {} to {}",
            self.paths.old.display(),
            self.paths.origin.display()
        );
        Ok(())
    }

    /// A new, empty directory next to origin for a copy-on-write save.
    pub fn create_tmp(&self) -> Result<PathBuf, LifecycleError> {
        let path = self
            .paths
            .base
            .join(format!("{}{}", TMP_DIR_PREFIX, uuid::Uuid::new_v4().simple()));
        create_dir(&path)?;
        Ok(path)
    }

    pub fn discard_tmp(&self, tmp: &Path) {
        if let Err(e) = remove_dir(tmp) {
            warn!("failed to remove {}: {}", tmp.display(), e);
        }
    }

    /// Publishes a completed save: origin becomes old, `tmp` becomes origin.
    /// The previous origin is put back if the second rename fails.
    pub fn switch_saved(&self, tmp: &Path) -> Result<(), LifecycleError> {
        remove_dir(&self.paths.old)?;
        rename(&self.paths.origin, &self.paths.old)?;
        if let Err(e) = rename(tmp, &self.paths.origin) {
            warn!("failed to publish saved index, restoring previous generation: {}", e);
            rename(&self.paths.old, &self.paths.origin)?;
            create_dir(&self.paths.old)?;
            return Err(e);
        }
        debug!(
            "switched saved index {} into {}",
            tmp.display(),
            self.paths.origin.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use tempfile::TempDir;

    fn write(path: &Path, name: &str) {
        fs::write(path.join(name), b"data").unwrap();
    }

    #[test]
    fn test_needs_backup_truth_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path();
        assert!(!needs_backup(path));

        write(path, "graph.cbor");
        assert!(needs_backup(path));

        metadata::store(path, &Metadata::invalid()).unwrap();
        assert!(needs_backup(path));

        metadata::store(path, &Metadata::valid(0)).unwrap();
        assert!(!needs_backup(path));

        // Non-zero count with a valid marker still deserves protection.
        metadata::store(path, &Metadata::valid(100)).unwrap();
        assert!(needs_backup(path));
    }

    #[test]
    fn test_needs_backup_missing_path() {
        let dir = TempDir::new().unwrap();
        assert!(!needs_backup(&dir.path().join("absent")));
    }

    #[test]
    fn test_quarantine_rotation() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), false, 2);
        manager.prepare().unwrap();
        let origin = manager.paths().origin.clone();

        let mut created = Vec::new();
        for i in 0..3 {
            write(&origin, &format!("file-{}", i));
            created.push(manager.quarantine(&origin).unwrap().unwrap());
        }

        let generations = manager.broken_generations().unwrap();
        assert_eq!(generations, created[1..].to_vec());
        assert!(list_dir(&origin).unwrap().is_empty());
    }

    #[test]
    fn test_quarantine_disabled() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), false, 0);
        manager.prepare().unwrap();
        write(&manager.paths().origin, "graph.cbor");

        assert!(manager.quarantine(&manager.paths().origin).unwrap().is_none());
        assert_eq!(manager.broken_count(), 0);
        assert!(list_dir(&manager.paths().origin).unwrap().is_empty());
    }

    #[test]
    fn test_quarantine_empty_is_noop() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), false, 3);
        manager.prepare().unwrap();
        assert!(manager.quarantine(&manager.paths().origin).unwrap().is_none());
        assert_eq!(manager.broken_count(), 0);
    }

    #[test]
    fn test_switch_saved_keeps_previous_generation() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), true, 3);
        manager.prepare().unwrap();
        write(&manager.paths().origin, "first");

        let tmp = manager.create_tmp().unwrap();
        write(&tmp, "second");
        manager.switch_saved(&tmp).unwrap();

        assert!(manager.paths().origin.join("second").exists());
        assert!(manager.paths().old.join("first").exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn test_prepare_removes_abandoned_tmp() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), true, 3);
        manager.prepare().unwrap();
        let tmp = manager.create_tmp().unwrap();
        manager.prepare().unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn test_prepare_publishes_completed_save_when_origin_is_missing() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), true, 3);
        manager.prepare().unwrap();
        write(&manager.paths().old, "previous");
        let partial = manager.create_tmp().unwrap();
        let completed = manager.create_tmp().unwrap();
        write(&completed, "graph.cbor");
        metadata::store(&completed, &Metadata::valid(2)).unwrap();
        fs::remove_dir_all(&manager.paths().origin).unwrap();

        manager.prepare().unwrap();

        assert!(manager.paths().origin.join("graph.cbor").exists());
        assert_eq!(metadata::load(&manager.paths().origin).unwrap().index_count, 2);
        assert!(manager.paths().old.join("previous").exists());
        assert!(!partial.exists());
        assert!(!completed.exists());
    }

    #[test]
    fn test_prepare_keeps_origin_over_completed_tmp() {
        let dir = TempDir::new().unwrap();
        let manager = DirectoryManager::new(dir.path(), true, 3);
        manager.prepare().unwrap();
        write(&manager.paths().origin, "current");
        let tmp = manager.create_tmp().unwrap();
        metadata::store(&tmp, &Metadata::valid(1)).unwrap();

        assert!(manager.resume_interrupted_switch().unwrap().is_none());
        manager.prepare().unwrap();

        assert!(manager.paths().origin.join("current").exists());
        assert!(!tmp.exists());
    }
}
