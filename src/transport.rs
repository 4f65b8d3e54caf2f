//! Transport contract.
//!
//! The cache never talks HTTP itself. Fetch and mutate closures call a
//! [`Transport`], which resolves relative paths, sends the request and
//! reports failures as a normalized [`TransportError`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;

pub type Query = [(String, String)];

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, query: &Query) -> Result<Value, TransportError>;
    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError>;
    async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError>;
    async fn patch(&self, path: &str, body: Value) -> Result<Value, TransportError>;
    async fn delete(&self, path: &str) -> Result<Value, TransportError>;
    async fn upload(&self, path: &str, form: UploadForm) -> Result<Value, TransportError>;
}

/// Multipart form payload for [`Transport::upload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadForm {
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.files.push(UploadFile {
            field: field.into(),
            file_name: file_name.into(),
            content_type: None,
            bytes,
        });
        self
    }

    /// Set the content type of the most recently added file.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        if let Some(file) = self.files.last_mut() {
            file.content_type = Some(content_type.into());
        }
        self
    }
}

/// Typed helpers over any [`Transport`].
#[async_trait]
pub trait TransportExt: Transport {
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &Query,
    ) -> Result<T, TransportError> {
        decode(self.get(path, query).await?)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        decode(self.post(path, encode(body)?).await?)
    }

    async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        decode(self.put(path, encode(body)?).await?)
    }

    async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        decode(self.patch(path, encode(body)?).await?)
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Decode a response body, reporting a shape mismatch as
/// [`TransportError::Decode`].
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|err| TransportError::decode(err.to_string()))
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value, TransportError> {
    serde_json::to_value(body)
        .map_err(|err| TransportError::decode(format!("failed to encode request body: {err}")))
}

/// Build a reusable fetch function reading `path` through `transport`.
pub fn get_fn<T>(
    transport: Arc<dyn Transport>,
    path: impl Into<String>,
    query: Vec<(String, String)>,
) -> impl Fn() -> BoxFuture<'static, Result<T, TransportError>> + Clone + Send + Sync + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    let path: Arc<str> = Arc::from(path.into());
    let query: Arc<[(String, String)]> = Arc::from(query);
    move || {
        let transport = Arc::clone(&transport);
        let path = Arc::clone(&path);
        let query = Arc::clone(&query);
        async move { transport.get_json::<T>(&path, &query).await }.boxed()
    }
}
