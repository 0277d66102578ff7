//! HTTP client for the GSM admin API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Success envelope of the server's admin responses.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
}

/// Error envelope returned by the server for failed requests.
#[derive(Debug, serde::Deserialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorInfo {
    code: String,
    message: String,
}

/// Basic-auth credentials for the `/admin` routes.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.user, Some(&c.password)),
            None => request,
        }
    }

    async fn send(&self, label: &str, request: RequestBuilder) -> Result<Response> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("{} failed", label))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            anyhow::bail!(
                "{}: unauthorized, pass --user/--password or set GSM_ADMIN_USER/GSM_ADMIN_PASSWORD",
                label
            );
        }
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => anyhow::bail!("API error ({} {}): {}", status, err.error.code, err.error.message),
            Err(_) => anyhow::bail!("API error ({}): {}", status, body),
        }
    }

    async fn data<T: DeserializeOwned>(&self, label: &str, resp: Response) -> Result<T> {
        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response of {}", label))?;
        if !api_resp.success {
            anyhow::bail!("{}: server reported failure", label);
        }
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("{}: API returned success but no data", label))
    }

    /// GET a wrapped response and return its data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let label = format!("GET {}", url);
        let resp = self.send(&label, self.client.get(&url)).await?;
        self.data(&label, resp).await
    }

    /// POST with an empty body and return the wrapped data.
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let label = format!("POST {}", url);
        let resp = self.send(&label, self.client.post(&url)).await?;
        self.data(&label, resp).await
    }

    /// POST raw bytes as `application/octet-stream`.
    pub async fn post_bytes<T: DeserializeOwned>(&self, path: &str, bytes: Vec<u8>) -> Result<T> {
        let url = self.url(path);
        let label = format!("POST {}", url);
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let resp = self.send(&label, request).await?;
        self.data(&label, resp).await
    }

    /// PUT a JSON body; the server answers with no content.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path);
        let label = format!("PUT {}", url);
        self.send(&label, self.client.put(&url).json(body)).await?;
        Ok(())
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let label = format!("DELETE {}", url);
        let resp = self.send(&label, self.client.delete(&url)).await?;
        self.data(&label, resp).await
    }

    /// DELETE where the server answers with no content.
    pub async fn delete_empty(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        let label = format!("DELETE {}", url);
        self.send(&label, self.client.delete(&url)).await?;
        Ok(())
    }

    /// GET an unwrapped JSON document (`/health`, `/metrics`).
    ///
    /// `/health` answers 503 with a full report when unhealthy, so any
    /// JSON body is returned regardless of status.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(_) if !status.is_success() => anyhow::bail!("API error ({}): {}", status, body),
            Err(e) => Err(e).with_context(|| format!("Failed to parse response from {}", url)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8080/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }

    #[test]
    fn test_error_envelope_parses() {
        let body = r#"{"success":false,"error":{"code":"NO_MODULE_MAPPING","numeric_code":1001,"message":"no module mapping defined for: /x supported mappings are: ","timestamp":"2024-01-01T00:00:00Z"}}"#;
        let parsed: ErrorResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.error.code, "NO_MODULE_MAPPING");
        assert!(parsed.error.message.starts_with("no module mapping"));
    }
}
