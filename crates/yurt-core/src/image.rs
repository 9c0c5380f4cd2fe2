//! Base image lookup.

use crate::error::{Component, CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use yurt_vm::AdapterError;

/// Provides the base appliance image the VM is imported from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Path of a local image ready for import.
    async fn ensure_image(&self) -> Result<PathBuf>;
}

/// An image that must already exist at a fixed path.
#[derive(Debug, Clone)]
pub struct LocalImage {
    path: PathBuf,
}

impl LocalImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImageSource for LocalImage {
    async fn ensure_image(&self) -> Result<PathBuf> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => {
                tracing::debug!(image = %self.path.display(), size = meta.len(), "Base image found");
                Ok(self.path.clone())
            }
            Ok(_) => Err(CoreError::infra(Component::Image)(AdapterError::Malformed(
                format!("{} is not a file", self.path.display()),
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(image = %self.path.display(), "Base image is missing");
                Err(CoreError::infra(Component::Image)(AdapterError::NotFound(
                    self.path.display().to_string(),
                )))
            }
            Err(e) => Err(CoreError::infra(Component::Image)(AdapterError::Io(e))),
        }
    }
}
