//! Configuration served from a git repository.
//!
//! The repository is shallow-cloned into a cache directory on first use.
//! Later refreshes fetch the requested ref and hard-reset the checkout to it,
//! so local edits in the cache never survive a refresh.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rcforge_core::{ParameterSet, TargetId};
use tokio::process::Command;
use tracing::{debug, info};

use super::{CachedDocument, ConfigDocument, ConfigSource};
use crate::error::ConfigError;

/// Default location of the document inside the repository.
pub const DEFAULT_DOCUMENT_PATH: &str = "rcforge.json";

#[derive(Debug)]
pub struct GitConfigSource {
    repo_url: String,
    git_ref: Option<String>,
    cache_dir: PathBuf,
    document: PathBuf,
    cached: CachedDocument,
}

impl GitConfigSource {
    /// `repo_url` is anything `git clone` accepts, including a local path.
    pub fn new(repo_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            git_ref: None,
            cache_dir: cache_dir.into(),
            document: PathBuf::from(DEFAULT_DOCUMENT_PATH),
            cached: CachedDocument::default(),
        }
    }

    /// Track a branch or tag instead of the remote's default HEAD.
    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    /// Path of the document relative to the repository root.
    pub fn with_document(mut self, document: impl Into<PathBuf>) -> Self {
        self.document = document.into();
        self
    }

    pub fn checkout_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Clone or update the checkout and parse the document.
    async fn sync(&self) -> Result<ConfigDocument, ConfigError> {
        if self.cache_dir.join(".git").is_dir() {
            let remote_ref = self.git_ref.as_deref().unwrap_or("HEAD");
            run_git(&self.cache_dir, &["fetch", "--depth", "1", "origin", remote_ref]).await?;
            run_git(&self.cache_dir, &["reset", "--hard", "FETCH_HEAD"]).await?;
            debug!(repo = %self.repo_url, git_ref = remote_ref, "configuration checkout updated");
        } else {
            if let Some(parent) = self.cache_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let dir = self.cache_dir.to_string_lossy().into_owned();
            let mut args = vec!["clone", "--depth", "1"];
            if let Some(git_ref) = &self.git_ref {
                args.push("--branch");
                args.push(git_ref);
            }
            args.push(&self.repo_url);
            args.push(&dir);
            let cwd = self.cache_dir.parent().unwrap_or_else(|| Path::new("."));
            run_git(cwd, &args).await?;
            debug!(repo = %self.repo_url, dir = %dir, "configuration repository cloned");
        }

        let path = self.cache_dir.join(&self.document);
        let raw = tokio::fs::read(&path).await.map_err(|e| {
            ConfigError::Malformed(format!("{}: {e}", path.display()))
        })?;
        let doc = ConfigDocument::from_json(&raw)?;
        info!(
            source = %self.describe(),
            version = doc.version.as_deref().unwrap_or("unversioned"),
            targets = doc.devices.len(),
            "configuration loaded"
        );
        Ok(doc)
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String, ConfigError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ConfigError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConfigError::Git(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ConfigSource for GitConfigSource {
    async fn resolve(
        &self,
        target: &TargetId,
        overrides: &ParameterSet,
    ) -> Result<ParameterSet, ConfigError> {
        let doc = self.cached.get_or_fetch(|| self.sync()).await?;
        doc.resolve(target, overrides)
    }

    async fn list_available(&self) -> Result<Vec<TargetId>, ConfigError> {
        let doc = self.cached.get_or_fetch(|| self.sync()).await?;
        Ok(doc.targets())
    }

    async fn refresh(&self) -> Result<(), ConfigError> {
        let doc = self.sync().await?;
        self.cached.replace(doc).await;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.git_ref {
            Some(git_ref) => format!("git:{}@{git_ref}", self.repo_url),
            None => format!("git:{}", self.repo_url),
        }
    }
}
