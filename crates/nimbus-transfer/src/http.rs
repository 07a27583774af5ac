//! `reqwest` implementation of the service contract.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, ETAG, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use nimbus_core::config::ApiConfig;
use nimbus_core::keys::EncryptedFileKey;
use nimbus_core::types::{
    CompleteS3UploadRequest, CompleteUploadRequest, DownloadToken, FileUploadRequest,
    GeneralSettings, MissingKeysFilter, MissingKeysResponse, Node, NodeId, PresignedUrlList,
    S3UploadStatus, UploadSession, UserFileKeySet,
};
use nimbus_core::{ApiErrorKind, NimbusError, NimbusResult};

use crate::api::{Credentials, StorageApi, TokenRefresher};

const API_PREFIX: &str = "/api/v4";

pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Build a client for `config.base_url`.
    ///
    /// A plaintext `http://` endpoint is rejected when `enforce_tls` is set
    /// and logged as a warning otherwise.
    pub fn new(config: &ApiConfig) -> NimbusResult<Self> {
        if config.base_url.starts_with("http://") {
            if config.enforce_tls {
                return Err(NimbusError::InsecureTransport(format!(
                    "endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                     Use an HTTPS endpoint or set api.enforce_tls = false for local development.",
                    config.base_url
                )));
            }
            warn!(
                endpoint = %config.base_url,
                "endpoint uses plaintext HTTP; tokens are transmitted unencrypted. \
                 Set api.enforce_tls = true and use HTTPS in production."
            );
        }

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .https_only(config.enforce_tls)
            .build()
            .map_err(|e| NimbusError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn authed(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.http.request(method, self.url(path)).bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> NimbusResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        trace!(status = status.as_u16(), url = %response.url().path(), "response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> NimbusResult<T> {
        let response = self.send(request).await?;
        let status = response.status();
        response.json::<T>().await.map_err(|e| {
            if e.is_decode() {
                NimbusError::Api {
                    kind: ApiErrorKind::Other,
                    status: status.as_u16(),
                    code: None,
                    message: format!("malformed response body: {e}"),
                }
            } else {
                transport_error(e)
            }
        })
    }
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct S3UrlsRequest {
    first_part_number: u32,
    last_part_number: u32,
    size: u64,
}

#[derive(Serialize)]
struct FileKeysBatch<'a> {
    items: &'a [UserFileKeySet],
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ErrorBody {
    message: Option<String>,
    error_code: Option<i64>,
}

#[async_trait]
impl StorageApi for HttpApi {
    async fn get_node(&self, token: &str, node_id: NodeId) -> NimbusResult<Node> {
        self.send_json(self.authed(Method::GET, &format!("/nodes/{node_id}"), token))
            .await
    }

    async fn get_server_general_settings(&self, token: &str) -> NimbusResult<GeneralSettings> {
        self.send_json(self.authed(Method::GET, "/config/info/general", token))
            .await
    }

    async fn create_file_upload(
        &self,
        token: &str,
        request: &FileUploadRequest,
    ) -> NimbusResult<UploadSession> {
        self.send_json(
            self.authed(Method::POST, "/nodes/files/uploads", token)
                .json(request),
        )
        .await
    }

    async fn upload_chunk(
        &self,
        token: &str,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
    ) -> NimbusResult<()> {
        let range = content_range(offset, chunk.len() as u64);
        let part = reqwest::multipart::Part::bytes(chunk.to_vec()).file_name("file");
        let form = reqwest::multipart::Form::new().part("file", part);
        self.send(
            self.authed(Method::POST, &format!("/uploads/{upload_id}"), token)
                .header(CONTENT_RANGE, range)
                .multipart(form),
        )
        .await?;
        Ok(())
    }

    async fn complete_file_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteUploadRequest,
    ) -> NimbusResult<Node> {
        self.send_json(
            self.authed(Method::PUT, &format!("/nodes/files/uploads/{upload_id}"), token)
                .json(request),
        )
        .await
    }

    async fn get_download_url(&self, token: &str, node_id: NodeId) -> NimbusResult<String> {
        let download: DownloadToken = self
            .send_json(self.authed(
                Method::POST,
                &format!("/nodes/files/{node_id}/downloads"),
                token,
            ))
            .await?;
        Ok(download.download_url)
    }

    async fn download_range(&self, url: &str, offset: u64, size: u64) -> NimbusResult<Bytes> {
        let response = self
            .send(self.http.get(url).header(RANGE, range_header(offset, size)))
            .await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(transport_error)?;
        check_range_response(status, content_range.as_deref(), offset, size, body.len() as u64)?;
        Ok(body)
    }

    async fn get_s3_upload_urls(
        &self,
        token: &str,
        upload_id: &str,
        first_part_number: u32,
        count: u32,
        size: u64,
    ) -> NimbusResult<PresignedUrlList> {
        let body = S3UrlsRequest {
            first_part_number,
            last_part_number: first_part_number + count.saturating_sub(1),
            size,
        };
        self.send_json(
            self.authed(
                Method::POST,
                &format!("/nodes/files/uploads/{upload_id}/s3_urls"),
                token,
            )
            .json(&body),
        )
        .await
    }

    async fn put_s3_part(&self, url: &str, chunk: Bytes) -> NimbusResult<String> {
        let response = self.send(self.http.put(url).body(chunk)).await?;
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                NimbusError::api(
                    ApiErrorKind::Other,
                    response.status().as_u16(),
                    "storage response carried no ETag",
                )
            })
    }

    async fn complete_s3_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteS3UploadRequest,
    ) -> NimbusResult<()> {
        self.send(
            self.authed(
                Method::PUT,
                &format!("/nodes/files/uploads/{upload_id}/s3"),
                token,
            )
            .json(request),
        )
        .await?;
        Ok(())
    }

    async fn get_s3_upload_status(
        &self,
        token: &str,
        upload_id: &str,
    ) -> NimbusResult<S3UploadStatus> {
        self.send_json(self.authed(
            Method::GET,
            &format!("/nodes/files/uploads/{upload_id}"),
            token,
        ))
        .await
    }

    async fn get_user_file_key(
        &self,
        token: &str,
        node_id: NodeId,
    ) -> NimbusResult<EncryptedFileKey> {
        self.send_json(self.authed(
            Method::GET,
            &format!("/nodes/files/{node_id}/user_file_key"),
            token,
        ))
        .await
    }

    async fn get_missing_file_keys(
        &self,
        token: &str,
        filter: MissingKeysFilter,
        offset: u64,
        limit: u64,
    ) -> NimbusResult<MissingKeysResponse> {
        let mut query = vec![
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(room_id) = filter.room_id {
            query.push(("room_id", room_id.to_string()));
        }
        if let Some(file_id) = filter.file_id {
            query.push(("file_id", file_id.to_string()));
        }
        self.send_json(
            self.authed(Method::GET, "/nodes/missingFileKeys", token)
                .query(&query),
        )
        .await
    }

    async fn set_file_keys(&self, token: &str, keys: &[UserFileKeySet]) -> NimbusResult<()> {
        self.send(
            self.authed(Method::POST, "/nodes/files/keys", token)
                .json(&FileKeysBatch { items: keys }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenRefresher for HttpApi {
    async fn refresh(&self, refresh_token: &str) -> NimbusResult<Credentials> {
        let url = format!("{}/oauth/token", self.base_url);
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response: TokenResponse = self.send_json(self.http.post(url).form(&form)).await?;
        Ok(Credentials::new(
            response.access_token,
            response.refresh_token,
        ))
    }
}

/// `Content-Range` value for an upload chunk.
pub fn content_range(offset: u64, len: u64) -> String {
    format!("bytes {}-{}/*", offset, offset + len)
}

/// `Range` value for `size` bytes at `offset` (inclusive end).
pub fn range_header(offset: u64, size: u64) -> String {
    format!("bytes={}-{}", offset, offset + size.saturating_sub(1))
}

/// Reject a ranged read whose bytes do not start at `offset`.
///
/// `206` must carry a `Content-Range` starting at `offset` when the header is
/// present. A plain `200` is the whole file, which is only usable for a read
/// at offset 0 that covers the entire body.
fn check_range_response(
    status: StatusCode,
    content_range: Option<&str>,
    offset: u64,
    size: u64,
    body_len: u64,
) -> NimbusResult<()> {
    let mismatch = |detail: String| {
        NimbusError::api(
            ApiErrorKind::Other,
            status.as_u16(),
            format!("range request for {size} bytes at offset {offset} not honored: {detail}"),
        )
    };
    match status {
        StatusCode::PARTIAL_CONTENT => match content_range.map(content_range_start) {
            None => Ok(()),
            Some(Some(start)) if start == offset => Ok(()),
            Some(Some(start)) => Err(mismatch(format!("response starts at {start}"))),
            Some(None) => Err(mismatch("unparsable Content-Range".into())),
        },
        StatusCode::OK if offset == 0 && body_len <= size => Ok(()),
        StatusCode::OK => Err(mismatch(format!("server returned {body_len} bytes with 200 OK"))),
        other => Err(mismatch(format!("unexpected status {}", other.as_u16()))),
    }
}

/// `bytes 100-199/300` → `100`.
fn content_range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn api_error(status: StatusCode, body: &str) -> NimbusError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| {
        if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.to_string()
        }
    });
    NimbusError::Api {
        kind: ApiErrorKind::classify(status.as_u16(), parsed.error_code),
        status: status.as_u16(),
        code: parsed.error_code,
        message,
    }
}

fn transport_error(e: reqwest::Error) -> NimbusError {
    if is_tls_failure(&e) {
        NimbusError::InsecureTransport(e.to_string())
    } else {
        NimbusError::Network(e.to_string())
    }
}

/// Walk the source chain looking for a TLS handshake or certificate failure.
fn is_tls_failure(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(e);
    while let Some(err) = current {
        let msg = err.to_string().to_ascii_lowercase();
        if msg.contains("certificate")
            || msg.contains("invalid peer")
            || msg.contains("tls handshake")
            || msg.contains("handshake failure")
            || msg.contains("handshakefailure")
        {
            return true;
        }
        current = err.source();
    }
    false
}
