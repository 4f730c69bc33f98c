//! External image storage.
//!
//! Workshop images live outside the database in an object store addressed
//! by opaque keys; the database only carries the key strings. Two
//! implementations: an HTTP-backed store for real deployments and an
//! in-process map for tests and `--dev` runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Blob operations the upload handlers need. `put` overwrites an existing
/// object under the same key; `remove` of a missing key is not an error.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Derive a fresh object key for an upload, preserving the original file
/// extension so stored objects keep a usable content hint.
pub fn object_key(original_filename: &str) -> String {
    let id = uuid::Uuid::new_v4();
    match std::path::Path::new(original_filename)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    }
}

/// Object store reachable over HTTP: `PUT`/`DELETE <base_url>/<key>`,
/// optionally authorized with a bearer token.
pub struct HttpImageStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpImageStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token),
            ),
            None => req,
        }
    }
}

#[async_trait]
impl ImageStore for HttpImageStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let req = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        self.authorize(req)
            .send()
            .await
            .context("Failed to send image upload request")?
            .error_for_status()
            .context("Image store returned error status on upload")?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let req = self.client.delete(self.object_url(key));
        self.authorize(req)
            .send()
            .await
            .context("Failed to send image delete request")?
            .error_for_status()
            .context("Image store returned error status on delete")?;
        Ok(())
    }
}

/// In-process store used by tests and `--dev` runs.
#[derive(Default)]
pub struct MemoryImageStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("Image store lock poisoned"))?;
        objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow::anyhow!("Image store lock poisoned"))?;
        objects.remove(key);
        Ok(())
    }
}
