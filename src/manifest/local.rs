//! Filesystem-backed manifest repository
//!
//! Layout (clusterctl local repository):
//!
//! ```text
//! <root>/<repository-dir>/<version>/<kind>-components.yaml
//! <root>/cluster-api/v1.8.0/core-components.yaml
//! <root>/infrastructure-docker/v1.8.0/infrastructure-components.yaml
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{highest_version, ManifestBundle, ManifestRepository, ManifestRequest};
use crate::{Error, Result};

/// Reads provider releases from a local directory tree
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    /// Repository rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root used for a request, honouring `fetchConfig.url`
    fn root_for(&self, request: &ManifestRequest) -> PathBuf {
        request
            .fetch_config
            .as_ref()
            .and_then(|f| f.url.as_deref())
            .map(|url| PathBuf::from(url.strip_prefix("file://").unwrap_or(url)))
            .unwrap_or_else(|| self.root.clone())
    }

    /// Release directory names present for a provider
    async fn list_versions(request: &ManifestRequest, provider_dir: &Path) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(provider_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(
                    request.provider_label(),
                    &request.version,
                    format!("no provider directory {}", provider_dir.display()),
                ))
            }
            Err(e) => return Err(Error::transient_fetch(request.provider_label(), e.to_string())),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::transient_fetch(request.provider_label(), e.to_string()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(versions)
    }

    /// Map the requested version to a concrete release directory name
    async fn resolve_version(request: &ManifestRequest, provider_dir: &Path) -> Result<String> {
        let versions = Self::list_versions(request, provider_dir).await?;

        let found = if request.is_latest() {
            highest_version(versions.iter().map(String::as_str))
        } else {
            // accept "1.0.0" for a "v1.0.0" directory and vice versa
            let wanted = request.version.strip_prefix('v').unwrap_or(&request.version);
            versions
                .iter()
                .map(String::as_str)
                .find(|v| *v == request.version)
                .or_else(|| {
                    versions
                        .iter()
                        .map(String::as_str)
                        .find(|v| v.strip_prefix('v').unwrap_or(*v) == wanted)
                })
        };

        found.map(str::to_string).ok_or_else(|| {
            Error::not_found(
                request.provider_label(),
                &request.version,
                format!("no matching release under {}", provider_dir.display()),
            )
        })
    }
}

#[async_trait]
impl ManifestRepository for LocalRepository {
    async fn resolve(&self, request: &ManifestRequest) -> Result<Arc<ManifestBundle>> {
        let provider_dir = self
            .root_for(request)
            .join(request.kind.repository_dir(&request.name));
        let version = Self::resolve_version(request, &provider_dir).await?;
        let file = provider_dir.join(&version).join(request.kind.components_file());

        debug!(
            provider = %request.provider_label(),
            version = %version,
            path = %file.display(),
            "Reading provider release"
        );

        let yaml = match tokio::fs::read_to_string(&file).await {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(
                    request.provider_label(),
                    &version,
                    format!("release has no {}", request.kind.components_file()),
                ))
            }
            Err(e) => {
                return Err(Error::transient_fetch(
                    request.provider_label(),
                    format!("failed to read {}: {}", file.display(), e),
                ))
            }
        };

        let bundle = ManifestBundle::from_yaml(request.kind, &request.name, version, &yaml)?;
        Ok(Arc::new(bundle))
    }
}
