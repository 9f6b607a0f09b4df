// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Array ↔ cache path mapping and transfer classification.

use std::path::{Component, Path, PathBuf};

use crate::command::{Direction, TransferCategory};
use crate::config::CacheEngineConfig;
use crate::error::QueueError;

/// Maps array-tier paths onto the mirrored cache-tier layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    array_root: PathBuf,
    cache_root: PathBuf,
    network_roots: Vec<PathBuf>,
    shared_filesystem: bool,
}

impl PathMapper {
    pub fn new(array_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            array_root: array_root.into(),
            cache_root: cache_root.into(),
            network_roots: Vec::new(),
            shared_filesystem: false,
        }
    }

    #[must_use]
    pub fn from_config(config: &CacheEngineConfig) -> Self {
        Self {
            array_root: config.array_root.clone(),
            cache_root: config.cache_root.clone(),
            network_roots: config.network_roots.clone(),
            shared_filesystem: config.tiers_share_filesystem,
        }
    }

    #[must_use]
    pub fn with_network_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.network_roots = roots;
        self
    }

    #[must_use]
    pub fn with_shared_filesystem(mut self, shared: bool) -> Self {
        self.shared_filesystem = shared;
        self
    }

    pub fn array_root(&self) -> &Path {
        &self.array_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Check that `source` is a usable array-tier target.
    pub fn validate_source(&self, source: &Path) -> Result<(), QueueError> {
        let invalid = |reason: &str| QueueError::InvalidTarget {
            path: source.to_path_buf(),
            reason: reason.to_string(),
        };
        if !source.is_absolute() {
            return Err(invalid("path must be absolute"));
        }
        if source.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(invalid("path must not contain '..'"));
        }
        if source.starts_with(&self.cache_root) {
            return Err(invalid("path is inside the cache tier"));
        }
        if !source.starts_with(&self.array_root) || source == self.array_root {
            return Err(invalid("path is not a file under the array root"));
        }
        Ok(())
    }

    /// Cache-tier location for an array-tier source path.
    pub fn cache_path_for(&self, source: &Path) -> Result<PathBuf, QueueError> {
        self.validate_source(source)?;
        let relative = source
            .strip_prefix(&self.array_root)
            .map_err(|_| QueueError::InvalidTarget {
                path: source.to_path_buf(),
                reason: "path is not under the array root".to_string(),
            })?;
        Ok(self.cache_root.join(relative))
    }

    #[must_use]
    pub fn is_network(&self, path: &Path) -> bool {
        self.network_roots.iter().any(|root| path.starts_with(root))
    }

    /// Pick the worker pool for a command moving `targets` in `direction`.
    #[must_use]
    pub fn classify(&self, direction: Direction, targets: &[PathBuf]) -> TransferCategory {
        let touches_network = targets.iter().any(|source| {
            self.is_network(source)
                || self
                    .cache_path_for(source)
                    .map(|cache| self.is_network(&cache))
                    .unwrap_or(false)
        });
        if touches_network {
            return TransferCategory::Network;
        }
        if self.shared_filesystem {
            return TransferCategory::Local;
        }
        match direction {
            Direction::ToCache => TransferCategory::CacheBound,
            Direction::ToArray => TransferCategory::ArrayBound,
        }
    }
}
