//! HTTP remote source.
//!
//! Route layout under the configured base URL:
//!
//! | Query / write        | Request                      |
//! |----------------------|------------------------------|
//! | detail               | `GET {kind}/{id}`            |
//! | list                 | `GET {kind}?{params}`        |
//! | reference table      | `GET references/{kind}`      |
//! | singleton            | `GET settings/{kind}`        |
//! | create               | `POST {kind}`                |
//! | partial update       | `PATCH {kind}/{id}`          |
//! | remove               | `DELETE {kind}/{id}`         |
//!
//! Any non-2xx status becomes [`RemoteError::Status`].

use std::time::Duration;

use async_trait::async_trait;
use coherence_wire::{ReadResponse, WriteOperation, WriteRequest};
use reqwest::{Client, Method, Response, Url};
use serde_json::Value;
use tracing::debug;

use crate::application::repos::{RemoteError, RemoteSource};
use crate::domain::keys::{CacheKey, KeyScope};

#[derive(Clone, Debug)]
pub struct HttpRemoteSource {
    client: Client,
    base: Url,
}

impl HttpRemoteSource {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, RemoteError> {
        if base.cannot_be_a_base() {
            return Err(RemoteError::Unavailable(format!(
                "`{base}` cannot be used as a base URL"
            )));
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(RemoteError::transport)?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("coherence/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                RemoteError::Unavailable(format!("`{}` cannot be used as a base URL", self.base))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// URL of the read endpoint addressed by `key`.
    pub fn read_url(&self, key: &CacheKey) -> Result<Url, RemoteError> {
        let kind = key.kind.as_str();
        match &key.scope {
            KeyScope::Detail { id } => self.url(&[kind, id.as_str()]),
            KeyScope::References => self.url(&["references", kind]),
            KeyScope::Singleton => self.url(&["settings", kind]),
            KeyScope::List { params } => {
                let mut url = self.url(&[kind])?;
                if let Value::Object(fields) = params.value()
                    && !fields.is_empty()
                {
                    let mut pairs = url.query_pairs_mut();
                    for (name, value) in fields {
                        match value {
                            Value::String(text) => pairs.append_pair(name, text),
                            other => pairs.append_pair(name, &other.to_string()),
                        };
                    }
                }
                Ok(url)
            }
        }
    }

    /// Method and URL of the write endpoint for `request`.
    pub fn write_target(&self, request: &WriteRequest) -> Result<(Method, Url), RemoteError> {
        let kind = request.resource_kind.as_str();
        let id = || {
            request.id.as_deref().ok_or_else(|| {
                RemoteError::Unavailable(format!("{kind} write is missing the resource id"))
            })
        };
        match request.operation {
            WriteOperation::Create => Ok((Method::POST, self.url(&[kind])?)),
            WriteOperation::Update => Ok((Method::PATCH, self.url(&[kind, id()?])?)),
            WriteOperation::Remove => Ok((Method::DELETE, self.url(&[kind, id()?])?)),
        }
    }

    async fn body(response: Response) -> Result<Vec<u8>, RemoteError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(RemoteError::transport)?;
        if !status.is_success() {
            debug!(
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&bytes),
                "Remote rejected request"
            );
            return Err(RemoteError::Status {
                code: status.as_u16(),
            });
        }
        Ok(bytes.to_vec())
    }
}

fn map_send_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::transport(err)
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn read(&self, key: &CacheKey) -> Result<ReadResponse, RemoteError> {
        let url = self.read_url(key)?;
        let response = self.client.get(url).send().await.map_err(map_send_error)?;
        let body = Self::body(response).await?;
        serde_json::from_slice(&body).map_err(RemoteError::decode)
    }

    async fn write(&self, request: &WriteRequest) -> Result<Value, RemoteError> {
        let (method, url) = self.write_target(request)?;
        let mut builder = self.client.request(method, url);
        if request.operation != WriteOperation::Remove {
            builder = builder.json(&request.payload);
        }
        let response = builder.send().await.map_err(map_send_error)?;
        let body = Self::body(response).await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(RemoteError::decode)
    }
}
