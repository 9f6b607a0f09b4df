// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transfer executor: blocking file moves and copies with verification.
//!
//! Every copy lands in `<dest>.partial`, is fsynced and verified, and only
//! then renamed into place. A move deletes its source only after that.
//! Same-filesystem moves are a plain rename; a cross-device rename falls back
//! to copy, verify, delete.
//!
//! Steps are idempotent so a command re-run after a crash converges:
//! a destination that already matches the source counts as transferred and a
//! move whose source is gone but whose destination exists counts as done.
//!
//! Run these on blocking threads (`spawn_blocking`).

mod verify;

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{StepOperation, TransferStep};
use crate::error::TransferError;

pub use verify::hash_file;

/// `EXDEV` on Linux and macOS
const CROSS_DEVICE_OS_ERROR: i32 = 18;

/// Ordered steps derived from one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub steps: Vec<TransferStep>,
}

impl TransferPlan {
    pub fn new(steps: Vec<TransferStep>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: TransferStep,
    /// Size of the file now at the destination
    pub bytes: u64,
    /// SHA-256 of the destination, when hashing is on
    pub content_hash: Option<String>,
    /// Found already applied (crash recovery)
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// Every step was checked (size, and hash when enabled)
    pub verified: bool,
    pub steps: Vec<StepOutcome>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferExecutor {
    verify_hash: bool,
}

impl TransferExecutor {
    #[must_use]
    pub fn new(verify_hash: bool) -> Self {
        Self { verify_hash }
    }

    /// Run every step of `plan`; on failure the completed steps are rolled
    /// back (best effort) before the error is returned.
    pub fn execute(&self, plan: &TransferPlan) -> Result<TransferResult, TransferError> {
        let started = Instant::now();
        let mut done: Vec<StepOutcome> = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            match self.run_step(step) {
                Ok(outcome) => done.push(outcome),
                Err(err) => {
                    warn!(source = ?step.source, destination = ?step.destination, error = %err, "Transfer step failed");
                    self.rollback(&done);
                    return Err(err);
                }
            }
        }

        let result = TransferResult {
            bytes_transferred: done.iter().map(|s| s.bytes).sum(),
            duration: started.elapsed(),
            verified: true,
            steps: done,
        };
        debug!(
            steps = result.steps.len(),
            bytes = result.bytes_transferred,
            elapsed_ms = result.duration.as_millis() as u64,
            "Transfer plan executed"
        );
        Ok(result)
    }

    fn run_step(&self, step: &TransferStep) -> Result<StepOutcome, TransferError> {
        match step.operation {
            StepOperation::Move => self.move_file(step),
            StepOperation::Copy => self.copy_file(step),
            StepOperation::Release => self.release(step),
        }
    }

    /// Undo completed steps, newest first.
    fn rollback(&self, done: &[StepOutcome]) {
        for outcome in done.iter().rev() {
            let inverse = outcome.step.inverse();
            match self.run_step(&inverse) {
                Ok(_) => debug!(destination = ?inverse.destination, "Rolled back step"),
                Err(e) => warn!(
                    source = ?inverse.source,
                    destination = ?inverse.destination,
                    error = %e,
                    "Rollback step failed; manual cleanup may be needed"
                ),
            }
        }
    }

    fn move_file(&self, step: &TransferStep) -> Result<StepOutcome, TransferError> {
        let (source, destination) = (&step.source, &step.destination);

        let source_meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Source gone and destination present: an earlier run finished
                return match fs::metadata(destination) {
                    Ok(meta) if meta.is_file() => {
                        info!(?destination, "Move already applied");
                        self.outcome(step, meta.len(), true)
                    }
                    _ => Err(TransferError::SourceUnavailable(source.clone())),
                };
            }
            Err(e) => return Err(TransferError::from_io(source, e)),
        };
        if !source_meta.is_file() {
            return Err(TransferError::SourceUnavailable(source.clone()));
        }

        if self.matches(source, source_meta.len(), destination)? {
            // Copied before a crash, source never removed
            remove(source)?;
            return self.outcome(step, source_meta.len(), true);
        }

        create_parent(destination)?;
        match fs::rename(source, destination) {
            Ok(()) => {
                sync_parent(destination);
                return self.outcome(step, source_meta.len(), false);
            }
            Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_OS_ERROR) => {
                debug!(?source, ?destination, "Cross-device move, copying");
            }
            Err(e) => return Err(TransferError::from_io(destination, e)),
        }

        let copied = self.copy_verified(source, destination)?;
        if let Err(e) = remove(source) {
            // Leave things as they were: drop the new copy, keep the source
            let _ = fs::remove_file(destination);
            return Err(e);
        }
        Ok(StepOutcome {
            step: step.clone(),
            bytes: copied.0,
            content_hash: copied.1,
            resumed: false,
        })
    }

    fn copy_file(&self, step: &TransferStep) -> Result<StepOutcome, TransferError> {
        let (source, destination) = (&step.source, &step.destination);
        let source_meta = source_metadata(source)?;

        if self.matches(source, source_meta.len(), destination)? {
            return self.outcome(step, source_meta.len(), true);
        }

        let (bytes, content_hash) = self.copy_verified(source, destination)?;
        Ok(StepOutcome {
            step: step.clone(),
            bytes,
            content_hash,
            resumed: false,
        })
    }

    /// Remove `source`, but only while `destination` holds an identical copy.
    fn release(&self, step: &TransferStep) -> Result<StepOutcome, TransferError> {
        let (source, destination) = (&step.source, &step.destination);
        let kept = match fs::metadata(destination) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(TransferError::SourceUnavailable(destination.clone())),
        };

        match fs::metadata(source) {
            Err(e) if e.kind() == ErrorKind::NotFound => return self.outcome(step, kept, true),
            Err(e) => return Err(TransferError::from_io(source, e)),
            Ok(_) => {}
        }

        if !self.matches(destination, kept, source)? {
            return Err(TransferError::verification(
                source,
                format!("{:?} differs from the copy being released", destination),
            ));
        }
        remove(source)?;
        self.outcome(step, kept, false)
    }

    /// Copy through `<dest>.partial`, verify, keep permissions, rename.
    fn copy_verified(&self, source: &Path, destination: &Path) -> Result<(u64, Option<String>), TransferError> {
        let size = source_metadata(source)?.len();
        ensure_space(destination, size)?;
        create_parent(destination)?;

        let partial = partial_path(destination);
        let result = self.copy_into(source, &partial, size);
        match result {
            Ok(hash) => {
                if let Err(e) = fs::rename(&partial, destination) {
                    let _ = fs::remove_file(&partial);
                    return Err(TransferError::from_io(destination, e));
                }
                sync_parent(destination);
                Ok((size, hash))
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    if cleanup.kind() != ErrorKind::NotFound {
                        warn!(?partial, error = %cleanup, "Failed to remove partial file");
                    }
                }
                Err(e)
            }
        }
    }

    fn copy_into(&self, source: &Path, partial: &Path, expected: u64) -> Result<Option<String>, TransferError> {
        let mut reader = File::open(source).map_err(|e| open_error(source, e))?;
        let mut writer = File::create(partial).map_err(|e| TransferError::from_io(partial, e))?;
        let copied = io::copy(&mut reader, &mut writer).map_err(|e| TransferError::from_io(partial, e))?;
        writer.sync_all().map_err(|e| TransferError::from_io(partial, e))?;
        drop(writer);

        if copied != expected {
            return Err(TransferError::verification(
                partial,
                format!("size mismatch: copied {} of {} bytes", copied, expected),
            ));
        }
        let written = fs::metadata(partial).map_err(|e| TransferError::from_io(partial, e))?.len();
        if written != expected {
            return Err(TransferError::verification(
                partial,
                format!("size mismatch: {} on disk, expected {}", written, expected),
            ));
        }

        let hash = if self.verify_hash {
            let source_hash = hash_file(source).map_err(|e| TransferError::from_io(source, e))?;
            let dest_hash = hash_file(partial).map_err(|e| TransferError::from_io(partial, e))?;
            if source_hash != dest_hash {
                return Err(TransferError::verification(partial, "content hash mismatch"));
            }
            Some(dest_hash)
        } else {
            None
        };

        let permissions = fs::metadata(source).map_err(|e| TransferError::from_io(source, e))?.permissions();
        fs::set_permissions(partial, permissions).map_err(|e| TransferError::from_io(partial, e))?;
        Ok(hash)
    }

    /// `candidate` exists with `size` bytes (and the same hash as `reference`
    /// when hashing is on).
    fn matches(&self, reference: &Path, size: u64, candidate: &Path) -> Result<bool, TransferError> {
        match fs::metadata(candidate) {
            Ok(meta) if meta.is_file() && meta.len() == size => {}
            _ => return Ok(false),
        }
        if !self.verify_hash {
            return Ok(true);
        }
        let a = hash_file(reference).map_err(|e| TransferError::from_io(reference, e))?;
        let b = hash_file(candidate).map_err(|e| TransferError::from_io(candidate, e))?;
        Ok(a == b)
    }

    fn outcome(&self, step: &TransferStep, bytes: u64, resumed: bool) -> Result<StepOutcome, TransferError> {
        let content_hash = if self.verify_hash && step.operation != StepOperation::Release {
            Some(hash_file(&step.destination).map_err(|e| TransferError::from_io(&step.destination, e))?)
        } else {
            None
        };
        Ok(StepOutcome {
            step: step.clone(),
            bytes,
            content_hash,
            resumed,
        })
    }
}

fn source_metadata(source: &Path) -> Result<fs::Metadata, TransferError> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_file() => Ok(meta),
        Ok(_) => Err(TransferError::SourceUnavailable(source.to_path_buf())),
        Err(e) => Err(open_error(source, e)),
    }
}

fn open_error(path: &Path, err: io::Error) -> TransferError {
    if err.kind() == ErrorKind::NotFound {
        TransferError::SourceUnavailable(path.to_path_buf())
    } else {
        TransferError::from_io(path, err)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

fn create_parent(destination: &Path) -> Result<(), TransferError> {
    match destination.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| TransferError::from_io(parent, e)),
        None => Ok(()),
    }
}

fn remove(path: &Path) -> Result<(), TransferError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::from_io(path, e)),
    }
}

/// Free space at the nearest existing ancestor of `destination`.
fn ensure_space(destination: &Path, needed: u64) -> Result<(), TransferError> {
    let mut ancestor = destination.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let available = fs2::available_space(dir).map_err(|e| TransferError::from_io(dir, e))?;
            if available < needed {
                return Err(TransferError::InsufficientSpace {
                    path: destination.to_path_buf(),
                    needed,
                    available,
                });
            }
            return Ok(());
        }
        ancestor = dir.parent();
    }
    Ok(())
}

/// Best effort: not every platform lets you fsync a directory.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    struct Tiers {
        _root: TempDir,
        array: PathBuf,
        cache: PathBuf,
    }

    fn tiers() -> Tiers {
        let root = tempdir().unwrap();
        let array = root.path().join("array");
        let cache = root.path().join("cache");
        fs::create_dir_all(&array).unwrap();
        fs::create_dir_all(&cache).unwrap();
        Tiers { _root: root, array, cache }
    }

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_move_removes_source() {
        let t = tiers();
        let src = t.array.join("movies/a.mkv");
        let dst = t.cache.join("movies/a.mkv");
        write(&src, b"frames");

        let plan = TransferPlan::new(vec![TransferStep::new(&src, &dst, StepOperation::Move)]);
        let result = TransferExecutor::new(true).execute(&plan).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"frames");
        assert_eq!(result.bytes_transferred, 6);
        assert!(result.verified);
        assert_eq!(result.steps[0].content_hash.as_deref(), Some(hash_file(&dst).unwrap().as_str()));
    }

    #[test]
    fn test_copy_keeps_both() {
        let t = tiers();
        let src = t.array.join("a.mkv");
        let dst = t.cache.join("deep/nested/a.mkv");
        write(&src, b"frames");

        let plan = TransferPlan::new(vec![TransferStep::new(&src, &dst, StepOperation::Copy)]);
        TransferExecutor::new(false).execute(&plan).unwrap();

        assert_eq!(fs::read(&src).unwrap(), b"frames");
        assert_eq!(fs::read(&dst).unwrap(), b"frames");
        assert!(!partial_path(&dst).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let t = tiers();
        let src = t.array.join("a.mkv");
        let dst = t.cache.join("a.mkv");
        write(&src, b"x");
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

        let plan = TransferPlan::new(vec![TransferStep::new(&src, &dst, StepOperation::Copy)]);
        TransferExecutor::default().execute(&plan).unwrap();
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let t = tiers();
        let plan = TransferPlan::new(vec![TransferStep::new(
            t.array.join("nope.mkv"),
            t.cache.join("nope.mkv"),
            StepOperation::Move,
        )]);
        let err = TransferExecutor::default().execute(&plan).unwrap_err();
        assert!(matches!(err, TransferError::SourceUnavailable(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_resumed_move_is_idempotent() {
        let t = tiers();
        let src = t.array.join("a.mkv");
        let dst = t.cache.join("a.mkv");
        write(&dst, b"frames");

        // Source already gone: the earlier run finished
        let plan = TransferPlan::new(vec![TransferStep::new(&src, &dst, StepOperation::Move)]);
        let result = TransferExecutor::default().execute(&plan).unwrap();
        assert!(result.steps[0].resumed);

        // Copied before a crash, source still present
        write(&src, b"frames");
        let result = TransferExecutor::new(true).execute(&plan).unwrap();
        assert!(result.steps[0].resumed);
        assert!(!src.exists());
    }

    #[test]
    fn test_stale_destination_is_overwritten() {
        let t = tiers();
        let src = t.array.join("a.mkv");
        let dst = t.cache.join("a.mkv");
        write(&src, b"new frames");
        write(&dst, b"old");

        let plan = TransferPlan::new(vec![TransferStep::new(&src, &dst, StepOperation::Copy)]);
        let result = TransferExecutor::default().execute(&plan).unwrap();
        assert!(!result.steps[0].resumed);
        assert_eq!(fs::read(&dst).unwrap(), b"new frames");
    }

    #[test]
    fn test_release_requires_identical_copy() {
        let t = tiers();
        let cached = t.cache.join("a.mkv");
        let array = t.array.join("a.mkv");
        write(&cached, b"frames");

        let step = TransferStep::new(&cached, &array, StepOperation::Release);
        let exec = TransferExecutor::default();

        // No array copy: refuse to delete the only copy
        assert!(exec.execute(&TransferPlan::new(vec![step.clone()])).is_err());
        assert!(cached.exists());

        write(&array, b"frames");
        exec.execute(&TransferPlan::new(vec![step])).unwrap();
        assert!(!cached.exists());
        assert!(array.exists());
    }

    #[test]
    fn test_failed_batch_rolls_back_completed_steps() {
        let t = tiers();
        let a = t.array.join("a.mkv");
        write(&a, b"aaa");

        let plan = TransferPlan::new(vec![
            TransferStep::new(&a, t.cache.join("a.mkv"), StepOperation::Move),
            TransferStep::new(t.array.join("missing.mkv"), t.cache.join("missing.mkv"), StepOperation::Move),
        ]);
        assert!(TransferExecutor::default().execute(&plan).is_err());

        assert_eq!(fs::read(&a).unwrap(), b"aaa");
        assert!(!t.cache.join("a.mkv").exists());
    }

    #[test]
    fn test_insufficient_space() {
        let t = tiers();
        assert!(matches!(
            ensure_space(&t.cache.join("x/y/z.mkv"), u64::MAX),
            Err(TransferError::InsufficientSpace { .. })
        ));
        ensure_space(&t.cache.join("x/y/z.mkv"), 1).unwrap();
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(partial_path(Path::new("/c/a.mkv")), PathBuf::from("/c/a.mkv.partial"));
    }
}
