//! Pre-key directory client.
//!
//! The directory is an external HTTP service holding each user's published
//! bundle. Failures are returned to the caller; nothing here retries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hearth_crypto::PreKeyBundle;
use parking_lot::RwLock;

use crate::error::ProtocolError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Directory: Send + Sync {
    /// `GET preKeyBundle(userId)`.
    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, ProtocolError>;

    /// `POST preKeyBundle(userId, bundle)`.
    async fn publish_bundle(&self, user_id: &str, bundle: &PreKeyBundle) -> Result<(), ProtocolError>;
}

/// Directory reached over HTTP at `{base_url}/prekey-bundle/{userId}`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProtocolError::Directory(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn bundle_url(&self, user_id: &str) -> String {
        format!("{}/prekey-bundle/{user_id}", self.base_url)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, ProtocolError> {
        let response = self
            .client
            .get(self.bundle_url(user_id))
            .send()
            .await
            .map_err(|e| ProtocolError::Directory(format!("GET bundle for {user_id}: {e}")))?
            .error_for_status()
            .map_err(|e| ProtocolError::Directory(format!("GET bundle for {user_id}: {e}")))?;

        let bundle = response
            .json::<PreKeyBundle>()
            .await
            .map_err(|e| ProtocolError::Deserialization(format!("bundle for {user_id}: {e}")))?;
        tracing::debug!(
            user = user_id,
            one_time_keys = bundle.one_time_pre_keys.len(),
            "fetched pre-key bundle"
        );
        Ok(bundle)
    }

    async fn publish_bundle(&self, user_id: &str, bundle: &PreKeyBundle) -> Result<(), ProtocolError> {
        self.client
            .post(self.bundle_url(user_id))
            .json(bundle)
            .send()
            .await
            .map_err(|e| ProtocolError::Directory(format!("POST bundle for {user_id}: {e}")))?
            .error_for_status()
            .map_err(|e| ProtocolError::Directory(format!("POST bundle for {user_id}: {e}")))?;
        tracing::info!(
            user = user_id,
            one_time_keys = bundle.one_time_pre_keys.len(),
            "published pre-key bundle"
        );
        Ok(())
    }
}

/// In-process directory. Serves tests and single-process setups.
#[derive(Default)]
pub struct MemoryDirectory {
    bundles: RwLock<HashMap<String, PreKeyBundle>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, ProtocolError> {
        self.bundles
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProtocolError::Directory(format!("no bundle published for {user_id}")))
    }

    async fn publish_bundle(&self, user_id: &str, bundle: &PreKeyBundle) -> Result<(), ProtocolError> {
        self.bundles
            .write()
            .insert(user_id.to_string(), bundle.clone());
        Ok(())
    }
}
