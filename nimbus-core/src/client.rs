use std::time::{Duration, SystemTime};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.nimbus.example";

#[derive(Debug, Error)]
pub enum NimbusError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct NimbusClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl NimbusClient {
    pub fn new(token: impl Into<String>) -> Result<Self, NimbusError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, NimbusError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_container(&self, id: &str) -> Result<ContainerInfo, NimbusError> {
        let mut url = self.endpoint("/v1/store/containers")?;
        url.query_pairs_mut().append_pair("id", id);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_entry(&self, path: &str) -> Result<Value, NimbusError> {
        let mut url = self.endpoint("/v1/store/entries")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_folder(
        &self,
        path: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<EntryPage, NimbusError> {
        let mut url = self.endpoint("/v1/store/entries/list")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_folder_all(
        &self,
        path: &str,
        page_size: u32,
    ) -> Result<Vec<Value>, NimbusError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_folder(path, Some(page_size), Some(offset))
                .await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            items.extend(page.items);
            if offset >= total {
                break;
            }
        }
        Ok(items)
    }

    pub async fn poll_changes(&self, cursor: Option<&str>) -> Result<ChangesPage, NimbusError> {
        let mut url = self.endpoint("/v1/store/changes")?;
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_download_link(&self, path: &str) -> Result<TransferLink, NimbusError> {
        let mut url = self.endpoint("/v1/store/entries/download")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_link(
        &self,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, NimbusError> {
        let mut url = self.endpoint("/v1/store/entries/upload")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_entry(&self, path: &str) -> Result<Option<TransferLink>, NimbusError> {
        let mut url = self.endpoint("/v1/store/entries")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    pub async fn move_entry(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, NimbusError> {
        self.relocate_entry("/v1/store/entries/move", from, path, overwrite)
            .await
    }

    pub async fn copy_entry(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, NimbusError> {
        self.relocate_entry("/v1/store/entries/copy", from, path, overwrite)
            .await
    }

    async fn relocate_entry(
        &self,
        endpoint: &str,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, NimbusError> {
        let mut url = self.endpoint(endpoint)?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_operation_status(
        &self,
        operation_url: &str,
    ) -> Result<OperationStatus, NimbusError> {
        let url = Url::parse(operation_url)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let info: OperationInfo = Self::handle_response(response).await?;
        Ok(info.status)
    }

    pub async fn list_versions(&self, path: &str) -> Result<Vec<VersionEntry>, NimbusError> {
        let mut url = self.endpoint("/v1/store/versions")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: VersionList = Self::handle_response(response).await?;
        Ok(payload.versions)
    }

    pub async fn restore_version(&self, path: &str, version_id: &str) -> Result<(), NimbusError> {
        let mut url = self.endpoint("/v1/store/versions/restore")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("version", version_id);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn resolve_version(&self, path: &str, version_id: &str) -> Result<(), NimbusError> {
        let mut url = self.endpoint("/v1/store/versions/resolve")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("version", version_id);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn delete_version(&self, path: &str, version_id: &str) -> Result<(), NimbusError> {
        let mut url = self.endpoint("/v1/store/versions")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("version", version_id);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, NimbusError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NimbusError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), NimbusError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> NimbusError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        NimbusError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl NimbusError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            NimbusError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            NimbusError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

// Retry-After carries either delay-seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now())
        .ok()
        .as_ref()
        .map(Duration::as_secs)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub root_path: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EntryPage {
    pub items: Vec<Value>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeRecord {
    pub path: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub entry: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangesPage {
    pub events: Vec<ChangeRecord>,
    pub cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Success,
    Failure,
    InProgress,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OperationInfo {
    pub status: OperationStatus,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
    #[serde(default)]
    pub templated: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionEntry {
    pub id: String,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct VersionList {
    versions: Vec<VersionEntry>,
}
