use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tidecache::config::{HttpSettings, LoadError};
use tidecache::telemetry::TelemetryError;
use tidecache::transport::{Query, Transport, UploadForm};
use tidecache::{CacheError, TransportError};
use tracing::debug;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("base URL is required (use --base-url or TIDECACHE__HTTP__BASE_URL)")]
    MissingBaseUrl,
    #[error("configuration error: {0}")]
    Config(#[from] LoadError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed: {0}")]
    Cache(#[from] CacheError),
    #[error("failed to render output: {0}")]
    Output(String),
}

/// [`Transport`] over HTTP with JSON bodies.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, CliError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
        })
    }

    pub fn from_settings(settings: &HttpSettings) -> Result<Self, CliError> {
        let base = settings.base_url.clone().ok_or(CliError::MissingBaseUrl)?;
        Self::new(base, settings.timeout)
    }

    pub fn user_agent() -> &'static str {
        concat!("tidecache/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve `path` below the base URL; a leading `/` does not escape it.
    pub fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportError::network(format!("invalid request path `{path}`: {err}")))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let mut url = self.url(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }

        debug!(%method, %url, "Sending request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(normalize_reqwest_error)?;
        handle(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, query: &Query) -> Result<Value, TransportError> {
        self.send(Method::GET, path, query, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.send(Method::PATCH, path, &[], Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value, TransportError> {
        self.send(Method::DELETE, path, &[], None).await
    }

    async fn upload(&self, path: &str, form: UploadForm) -> Result<Value, TransportError> {
        let url = self.url(path)?;
        let mut multipart = reqwest::multipart::Form::new();
        for (name, value) in form.fields {
            multipart = multipart.text(name, value);
        }
        for file in form.files {
            let mut part = reqwest::multipart::Part::bytes(file.bytes).file_name(file.file_name);
            if let Some(content_type) = file.content_type {
                part = part.mime_str(&content_type).map_err(|err| {
                    TransportError::validation(
                        format!("invalid content type `{content_type}`"),
                        [("content_type".to_string(), vec![err.to_string()])].into(),
                    )
                })?;
            }
            multipart = multipart.part(file.field, part);
        }

        debug!(%url, "Uploading form");
        let response = self
            .client
            .post(url)
            .multipart(multipart)
            .send()
            .await
            .map_err(normalize_reqwest_error)?;
        handle(response).await
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

fn normalize_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::network("request timed out");
    }
    TransportError::network(err.to_string())
}

async fn handle(response: Response) -> Result<Value, TransportError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(normalize_reqwest_error)?;

    if status.is_success() {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(&bytes)
            .map_err(|err| TransportError::decode(format!("failed to parse body: {err}")));
    }

    let body = serde_json::from_slice::<Value>(&bytes).ok();
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Err(error_from_response(status, body, text))
}

/// Map a non-2xx response to the normalized `{message, details}` shape.
///
/// Bodies like `{"message": "...", "errors": {"field": ["..."]}}` on 400
/// and 422 become validation errors; everything else is a server error
/// carrying the parsed body as details.
fn error_from_response(status: StatusCode, body: Option<Value>, text: String) -> TransportError {
    let message = body
        .as_ref()
        .and_then(|body| body.get("message").or_else(|| body.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) {
        let fields = body
            .as_ref()
            .and_then(|body| body.get("errors").or_else(|| body.get("fields")))
            .and_then(|fields| serde_json::from_value(fields.clone()).ok());
        if let Some(fields) = fields {
            return TransportError::validation(message, fields);
        }
    }

    let error = TransportError::server(status.as_u16(), message);
    match body {
        Some(details) => error.with_details(details),
        None => error,
    }
}
