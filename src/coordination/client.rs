use async_trait::async_trait;
use std::time::Duration;

use super::protocol::{CasRequest, CasResponse, ENDPOINT_CAS, ENDPOINT_READ, ReadResponse};
use super::store::{CoordinationStore, StoreError, VersionedValue};

/// Coordination store reached over HTTP, served by another site's [`super::handlers`].
///
/// One request per call; retrying is left to the caller, which owns the time budget.
pub struct HttpCoordinationStore {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpCoordinationStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn post<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response, StoreError> {
        self.http_client
            .post(url)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, StoreError> {
        self.http_client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl CoordinationStore for HttpCoordinationStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let response = self
            .get(format!("{}{}/{}", self.base_url, ENDPOINT_READ, key))
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        Ok(body.value.map(|value| VersionedValue {
            value,
            version: body.version,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: String,
    ) -> Result<bool, StoreError> {
        let payload = CasRequest {
            key: key.to_string(),
            expected_version: expected,
            value,
        };
        let response = self
            .post(format!("{}{}", self.base_url, ENDPOINT_CAS), &payload)
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }

        let body: CasResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        Ok(body.applied)
    }
}
