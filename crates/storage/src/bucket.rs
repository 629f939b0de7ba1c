use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::Clock;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// In-memory object storage made of named buckets.
#[derive(Clone)]
pub struct ObjectStorage {
    buckets: Arc<Mutex<HashMap<String, BTreeMap<String, StoredObject>>>>,
    public_base: Url,
    clock: Clock,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    info: ObjectInfo,
}

/// Metadata describing a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub name: String,
    pub bucket: String,
    pub size: usize,
    pub content_type: String,
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options accepted by [`Bucket::upload`].
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    /// Replace an existing object instead of failing.
    pub upsert: bool,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedObject {
    pub path: String,
    #[serde(rename = "fullPath")]
    pub full_path: String,
}

/// Result of [`Bucket::get_public_url`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicUrl {
    #[serde(rename = "publicUrl")]
    pub public_url: String,
}

/// Errors returned by storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageObjectError {
    #[error("invalid object path '{0}'")]
    InvalidPath(String),
    #[error("the resource already exists: {0}")]
    AlreadyExists(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("failed to build public url: {0}")]
    Url(#[from] url::ParseError),
}

impl StorageObjectError {
    /// HTTP-like status code reported by the storage API.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidPath(_) | Self::Url(_) => 400,
            Self::AlreadyExists(_) => 409,
            Self::NotFound(_) => 404,
        }
    }
}

impl ObjectStorage {
    /// Creates storage whose public URLs are rooted at `public_base`.
    pub fn new(public_base: Url, clock: Clock) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            public_base,
            clock,
        }
    }

    /// Returns a handle scoped to `bucket`. Buckets are created on first write.
    pub fn from(&self, bucket: &str) -> Bucket {
        Bucket {
            storage: self.clone(),
            name: bucket.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, StoredObject>>> {
        self.buckets.lock().expect("object storage poisoned")
    }
}

/// Handle to a single bucket.
#[derive(Clone)]
pub struct Bucket {
    storage: ObjectStorage,
    name: String,
}

impl Bucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upload(
        &self,
        path: &str,
        bytes: impl Into<Vec<u8>>,
        options: UploadOptions,
    ) -> Result<UploadedObject, StorageObjectError> {
        let path = validate_path(path)?;
        let bytes = bytes.into();
        let now = (self.storage.clock)();
        let mut buckets = self.storage.lock();
        let objects = buckets.entry(self.name.clone()).or_default();

        let created_at = match objects.get(&path) {
            Some(_) if !options.upsert => {
                return Err(StorageObjectError::AlreadyExists(format!(
                    "{}/{}",
                    self.name, path
                )))
            }
            Some(existing) => existing.info.created_at,
            None => now,
        };

        let info = ObjectInfo {
            name: path.clone(),
            bucket: self.name.clone(),
            size: bytes.len(),
            content_type: options
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            etag: hex::encode(Sha256::digest(&bytes)),
            created_at,
            updated_at: now,
        };
        debug!(stage = "storage", bucket = %self.name, path = %path, size = info.size, "object uploaded");
        objects.insert(path.clone(), StoredObject { bytes, info });

        Ok(UploadedObject {
            full_path: format!("{}/{}", self.name, path),
            path,
        })
    }

    pub fn download(&self, path: &str) -> Result<Vec<u8>, StorageObjectError> {
        let path = validate_path(path)?;
        self.storage
            .lock()
            .get(&self.name)
            .and_then(|objects| objects.get(&path))
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StorageObjectError::NotFound(format!("{}/{}", self.name, path)))
    }

    /// Removes the listed objects and returns the ones that existed. Missing paths are ignored.
    pub fn remove(&self, paths: &[&str]) -> Result<Vec<ObjectInfo>, StorageObjectError> {
        let paths = paths
            .iter()
            .map(|path| validate_path(path))
            .collect::<Result<Vec<_>, _>>()?;
        let mut buckets = self.storage.lock();
        let Some(objects) = buckets.get_mut(&self.name) else {
            return Ok(Vec::new());
        };
        let removed: Vec<ObjectInfo> = paths
            .iter()
            .filter_map(|path| objects.remove(path))
            .map(|object| object.info)
            .collect();
        debug!(stage = "storage", bucket = %self.name, removed = removed.len(), "objects removed");
        Ok(removed)
    }

    /// Lists objects whose name starts with `prefix`, sorted by name.
    pub fn list(&self, prefix: &str) -> Vec<ObjectInfo> {
        self.storage
            .lock()
            .get(&self.name)
            .map(|objects| {
                objects
                    .values()
                    .filter(|object| object.info.name.starts_with(prefix))
                    .map(|object| object.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds the public URL of `path`. The object does not need to exist.
    pub fn get_public_url(&self, path: &str) -> Result<PublicUrl, StorageObjectError> {
        let path = validate_path(path)?;
        let mut url = self.storage.public_base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["storage", "v1", "object", "public", self.name.as_str()])
            .extend(path.split('/'));
        Ok(PublicUrl {
            public_url: url.to_string(),
        })
    }
}

fn validate_path(path: &str) -> Result<String, StorageObjectError> {
    let trimmed = path.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || trimmed.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(StorageObjectError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}
