//! Configuration sources.
//!
//! A [`ConfigSource`] turns a target plus user overrides into the concrete
//! [`ParameterSet`] handed to the toolchain. Two backends ship here: a git
//! repository checked out locally and a plain HTTP endpoint. Both serve the
//! same [`ConfigDocument`] format.

mod document;
pub mod git;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use rcforge_core::{ParameterSet, TargetId};
use tokio::sync::Mutex;

use crate::error::ConfigError;

pub use document::{ConfigDocument, DeviceConfig, ParameterDefinition, ParameterKind};
pub use git::GitConfigSource;
pub use http::HttpConfigSource;

/// Resolves build parameters for a target.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Merge defaults for `target` with `overrides` and validate the result.
    async fn resolve(
        &self,
        target: &TargetId,
        overrides: &ParameterSet,
    ) -> Result<ParameterSet, ConfigError>;

    /// Targets this source has configuration for.
    async fn list_available(&self) -> Result<Vec<TargetId>, ConfigError>;

    /// Drop any cached document and fetch a fresh one.
    async fn refresh(&self) -> Result<(), ConfigError>;

    /// Short label used in logs.
    fn describe(&self) -> String;
}

/// Lazily fetched document shared by the remote backends.
#[derive(Debug, Default)]
pub(crate) struct CachedDocument {
    slot: Mutex<Option<Arc<ConfigDocument>>>,
}

impl CachedDocument {
    /// Return the cached document, running `fetch` first if there is none.
    ///
    /// The lock is held across the fetch so concurrent callers share a
    /// single download.
    pub(crate) async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<Arc<ConfigDocument>, ConfigError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ConfigDocument, ConfigError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(doc) = slot.as_ref() {
            return Ok(doc.clone());
        }
        let doc = Arc::new(fetch().await?);
        *slot = Some(doc.clone());
        Ok(doc)
    }

    pub(crate) async fn replace(&self, doc: ConfigDocument) {
        *self.slot.lock().await = Some(Arc::new(doc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cached_document_fetches_once() {
        let cache = CachedDocument::default();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_fetch(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ConfigDocument::default())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = CachedDocument::default();
        let err = cache
            .get_or_fetch(|| async { Err(ConfigError::Fetch("offline".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Fetch(_)));

        let doc = cache
            .get_or_fetch(|| async { Ok(ConfigDocument::default()) })
            .await
            .unwrap();
        assert!(doc.devices.is_empty());
    }
}
