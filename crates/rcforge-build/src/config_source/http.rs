//! Configuration served by an HTTP endpoint returning the JSON document.

use std::time::Duration;

use async_trait::async_trait;
use rcforge_core::{ParameterSet, TargetId};
use tracing::info;

use super::{CachedDocument, ConfigDocument, ConfigSource};
use crate::error::ConfigError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct HttpConfigSource {
    url: String,
    client: reqwest::Client,
    cached: CachedDocument,
}

impl HttpConfigSource {
    pub fn new(url: impl Into<String>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rcforge/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
            cached: CachedDocument::default(),
        })
    }

    async fn download(&self) -> Result<ConfigDocument, ConfigError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConfigError::Fetch(format!("{} returned {status}", self.url)));
        }
        let body = response.bytes().await?;
        let doc = ConfigDocument::from_json(&body)?;
        info!(
            source = %self.describe(),
            version = doc.version.as_deref().unwrap_or("unversioned"),
            targets = doc.devices.len(),
            "configuration loaded"
        );
        Ok(doc)
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn resolve(
        &self,
        target: &TargetId,
        overrides: &ParameterSet,
    ) -> Result<ParameterSet, ConfigError> {
        let doc = self.cached.get_or_fetch(|| self.download()).await?;
        doc.resolve(target, overrides)
    }

    async fn list_available(&self) -> Result<Vec<TargetId>, ConfigError> {
        let doc = self.cached.get_or_fetch(|| self.download()).await?;
        Ok(doc.targets())
    }

    async fn refresh(&self) -> Result<(), ConfigError> {
        let doc = self.download().await?;
        self.cached.replace(doc).await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}
