//! Image entity and source locations
//!
//! An [`Image`] is the unit of data flowing through every stage: raw after
//! the fetch stage, tagged with its transform after the transform stage.
//! Destination names are derived only from the origin and the transform tag,
//! so re-running the same inputs overwrites the same files.

use crate::{sanitize_filename, validate_url, Fetcher, PipelineError, Result, Store, Transform, TransformKind};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Directory used for unmodified images when raw persistence is enabled.
pub const RAW_DIR: &str = "raw";

const MAX_READABLE_STEM: usize = 96;

/// An addressable reference to remote image content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation(Url);

impl SourceLocation {
    pub fn parse(input: &str) -> Result<Self> {
        validate_url(input.trim())
            .map(Self)
            .map_err(|_| PipelineError::InvalidLocation(input.to_string()))
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Filesystem-safe name unique to this location.
    ///
    /// A readable prefix built from scheme, host, port, path and query is
    /// followed by the first 8 hex digits of the SHA-256 of the full URL, so
    /// locations that sanitize to the same prefix still get distinct names.
    pub fn file_stem(&self) -> String {
        let url = &self.0;
        let escape = |part: &str| part.replace('_', "__");

        let mut readable = format!("{}_{}", url.scheme(), escape(url.host_str().unwrap_or_default()));
        if let Some(port) = url.port() {
            readable.push_str(&format!("_{port}"));
        }
        readable.push_str(&escape(url.path()));
        if let Some(query) = url.query() {
            readable.push('_');
            readable.push_str(&escape(query));
        }

        let mut readable: String = sanitize_filename(&readable)
            .chars()
            .take(MAX_READABLE_STEM)
            .collect();
        if readable.is_empty() {
            readable.push_str("image");
        }

        format!("{readable}-{}", self.digest())
    }

    fn digest(&self) -> String {
        let hash = Sha256::digest(self.0.as_str().as_bytes());
        hex::encode(&hash[..4])
    }

    /// Lower-cased extension of the URL path, when it has a plain one.
    fn extension(&self) -> Option<String> {
        Path::new(self.0.path())
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase())
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceLocation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SourceLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Image content at one pipeline stage.
#[derive(Debug, Clone)]
pub struct Image {
    origin: SourceLocation,
    payload: Vec<u8>,
    applied_transform: Option<TransformKind>,
}

impl Image {
    /// A raw image as returned by the fetch collaborator.
    pub fn new(origin: SourceLocation, payload: Vec<u8>) -> Self {
        Self {
            origin,
            payload,
            applied_transform: None,
        }
    }

    /// Retrieve the bytes behind `location`. No retry is performed here.
    pub async fn fetch(location: &SourceLocation, fetcher: &dyn Fetcher) -> Result<Self> {
        let payload = fetcher.fetch(location).await?;
        if payload.is_empty() {
            return Err(PipelineError::fetch(location, "empty response body"));
        }

        debug!("Fetched {} bytes from {}", payload.len(), location);
        Ok(Self::new(location.clone(), payload))
    }

    /// Apply one transform, producing a derived image tagged with its kind.
    pub fn transformed(&self, transform: &dyn Transform) -> Result<Self> {
        let payload = transform.apply(&self.payload).map_err(|e| match e {
            PipelineError::Decode { cause, .. } => PipelineError::decode(&self.origin, cause),
            other => other,
        })?;

        Ok(Self {
            origin: self.origin.clone(),
            payload,
            applied_transform: Some(transform.kind()),
        })
    }

    /// Deterministic destination under `root`: `<tag>/<stem>.png` for
    /// variants, `raw/<stem>[.<ext>]` for unmodified images.
    pub fn destination(&self, root: &Path) -> PathBuf {
        let stem = self.origin.file_stem();
        match self.applied_transform {
            Some(kind) => root.join(kind.tag()).join(format!("{stem}.png")),
            None => {
                let file_name = match self.origin.extension() {
                    Some(ext) => format!("{stem}.{ext}"),
                    None => stem,
                };
                root.join(RAW_DIR).join(file_name)
            }
        }
    }

    pub async fn store(&self, store: &dyn Store, root: &Path) -> Result<StoredArtifact> {
        let destination = self.destination(root);
        let artifact = store.write(&destination, &self.payload).await?;
        Ok(artifact.with_source(&self.origin, self.applied_transform))
    }

    pub fn origin(&self) -> &SourceLocation {
        &self.origin
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn applied_transform(&self) -> Option<TransformKind> {
        self.applied_transform
    }
}

/// Handle to bytes persisted by a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformKind>,
}

impl StoredArtifact {
    pub fn new(path: impl Into<PathBuf>, bytes: usize) -> Self {
        Self {
            path: path.into(),
            bytes,
            origin: None,
            transform: None,
        }
    }

    pub fn with_source(mut self, origin: &SourceLocation, transform: Option<TransformKind>) -> Self {
        self.origin = Some(origin.to_string());
        self.transform = transform;
        self
    }
}
