use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use super::{ObjectInfo, StorageError};

pub const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Google Cloud Storage through its JSON API.
///
/// Authentication is a bearer token supplied by the environment (for example
/// `gcloud auth print-access-token` or a workload identity sidecar).
#[derive(Debug, Clone)]
pub struct GcsStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
    /// The JSON API encodes uint64 values as strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

impl GcsStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token,
        })
    }

    pub fn name(&self) -> &str {
        "gcs"
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StorageError::InvalidKey(format!("{}: {}", self.endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidKey(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        // `extend` percent-encodes '/' inside the key, which is what the JSON API expects.
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn status_error(&self, key: &str, status: StatusCode) -> StorageError {
        StorageError::Status {
            backend: self.name().to_string(),
            key: key.to_string(),
            status: status.as_u16(),
        }
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;

        let response = self
            .authorize(self.client.post(url))
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type_for(key))
            .body(bytes.to_vec())
            .send()
            .await?;

        if response.status().is_success() {
            tracing::debug!("Uploaded {} to gs://{}/{}", key, self.bucket, key);
            Ok(())
        } else {
            Err(self.status_error(key, response.status()))
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.client.get(url))
            .query(&[("alt", "media")])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(self.status_error(key, status)),
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .authorize(self.client.get(url.clone()))
                .query(&[("prefix", prefix)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(self.status_error(prefix, response.status()));
            }

            let page: ListResponse =
                response
                    .json()
                    .await
                    .map_err(|e| StorageError::Malformed {
                        backend: self.name().to_string(),
                        message: e.to_string(),
                    })?;

            objects.extend(page.items.into_iter().map(|item| ObjectInfo {
                size: item.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                modified: item
                    .updated
                    .and_then(|u| DateTime::parse_from_rfc3339(&u).ok())
                    .map(|u| u.with_timezone(&Utc)),
                key: item.name,
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.object_url(key)?;
        let response = self.authorize(self.client.delete(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(self.status_error(key, status)),
        }
    }
}

fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".json") {
        "application/json"
    } else if key.ends_with(".csv") {
        "text/csv"
    } else {
        "application/octet-stream"
    }
}
