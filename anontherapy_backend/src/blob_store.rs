use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::transcript::Turn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the transcript blob store: a publisher endpoint that accepts
/// uploads and returns an opaque blob id, and an aggregator endpoint that
/// serves blobs back by id. Storage is at-least-once from the caller's view;
/// every store returns a fresh handle and the newest one wins downstream.
#[derive(Clone)]
pub struct BlobStoreClient {
    publisher_url: String,
    aggregator_url: String,
    store_epochs: u32,
    client: reqwest::Client,
}

/// Publisher response. Uploads of brand-new content come back under
/// `newlyCreated`; re-uploads of bytes the store already holds come back
/// under `alreadyCertified`. Both carry the blob id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreBlobResponse {
    newly_created: Option<NewlyCreated>,
    already_certified: Option<AlreadyCertified>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewlyCreated {
    blob_object: BlobObject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobObject {
    blob_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlreadyCertified {
    blob_id: String,
}

impl BlobStoreClient {
    pub fn new(publisher_url: String, aggregator_url: String, store_epochs: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            publisher_url: trim_base_url(publisher_url),
            aggregator_url: trim_base_url(aggregator_url),
            store_epochs,
            client,
        }
    }

    /// Persist a transcript and return its opaque blob id.
    pub async fn store(&self, turns: &[Turn]) -> Result<String> {
        let payload = serde_json::to_vec(turns).context("Failed to serialize transcript")?;
        let url = format!(
            "{}/v1/store?epochs={}",
            self.publisher_url, self.store_epochs
        );

        let response = self
            .client
            .put(&url)
            .body(payload)
            .send()
            .await
            .context("Failed to reach blob publisher")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Blob publisher returned error {}: {}", status, body);
        }

        let store_response: StoreBlobResponse = response
            .json()
            .await
            .context("Failed to parse blob publisher response")?;
        extract_blob_id(store_response)
    }

    /// Fetch a transcript by blob id. Unknown or expired ids fail; the
    /// caller is expected to leave its conversation untouched.
    pub async fn fetch(&self, blob_id: &str) -> Result<Vec<Turn>> {
        let url = format!("{}/v1/{}", self.aggregator_url, blob_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach blob aggregator")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Blob aggregator returned error {} for blob {}",
                response.status(),
                blob_id
            );
        }

        response
            .json::<Vec<Turn>>()
            .await
            .with_context(|| format!("Blob {} does not contain a transcript", blob_id))
    }
}

fn extract_blob_id(response: StoreBlobResponse) -> Result<String> {
    if let Some(created) = response.newly_created {
        return Ok(created.blob_object.blob_id);
    }
    if let Some(certified) = response.already_certified {
        return Ok(certified.blob_id);
    }
    anyhow::bail!("Blob publisher response carried no blob id")
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_blob_id_from_newly_created_shape() {
        let response: StoreBlobResponse = serde_json::from_value(serde_json::json!({
            "newlyCreated": {
                "blobObject": { "blobId": "abc123", "size": 512 },
                "cost": 42
            }
        }))
        .expect("decode publisher response");
        assert_eq!(extract_blob_id(response).unwrap(), "abc123");
    }

    #[test]
    fn extracts_blob_id_from_already_certified_shape() {
        let response: StoreBlobResponse = serde_json::from_value(serde_json::json!({
            "alreadyCertified": { "blobId": "def456", "endEpoch": 99 }
        }))
        .expect("decode publisher response");
        assert_eq!(extract_blob_id(response).unwrap(), "def456");
    }

    #[test]
    fn rejects_publisher_response_without_blob_id() {
        let response: StoreBlobResponse =
            serde_json::from_value(serde_json::json!({})).expect("decode empty response");
        assert!(extract_blob_id(response).is_err());
    }

    #[test]
    fn trims_trailing_slash_from_base_urls() {
        assert_eq!(
            trim_base_url("http://publisher:31415/".to_string()),
            "http://publisher:31415"
        );
    }
}
