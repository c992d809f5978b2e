// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making requests to the TrueNAS Scale REST API.
//!
//! [`Gateway`] is the transport seam: one authenticated request in, raw
//! response bytes or an [`Error`] out. [`Client`] is the reqwest-backed
//! implementation. The typed VM and device calls in [`TrueNasApi`] are
//! provided for every gateway, which lets tests substitute a fake transport
//! without reimplementing them.
//!
//! Nothing in this crate retries. Retry policy belongs to callers.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, o, Logger};
use thiserror::Error;

pub mod api;

pub use reqwest::Method;

use api::{
    DeviceCreateRequest, DeviceRecord, DeviceUpdateRequest, PowerAction,
    VmRecord,
};

/// Path prefix of the versioned REST API.
pub const API_PREFIX: &str = "/api/v2.0";

/// Timeout applied to every HTTP call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors which may be returned from the TrueNAS client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("base URL cannot be empty")]
    EmptyBaseUrl,

    #[error("API key cannot be empty")]
    EmptyApiKey,

    #[error("error serializing request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("error parsing response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// The HTTP status code, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A transport able to issue one authenticated request against the API.
///
/// `path` is relative to [`API_PREFIX`], e.g. `/vm/id/4`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Bytes, Error>;
}

/// Client-side connection to a TrueNAS host.
pub struct Client {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    log: Logger,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The API key stays out of debug output.
        f.debug_struct("Client").field("base_url", &self.base_url).finish()
    }
}

// Sends "request", awaits "response", and returns an error carrying the
// status and body on any non-success status code.
async fn send_and_check_ok(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, Error> {
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status { status: status.as_u16(), body });
    }

    Ok(response)
}

impl Client {
    /// Creates a client for `base_url` (scheme and host, without the API
    /// prefix) authenticating with `api_key`.
    pub fn new(
        base_url: &str,
        api_key: &str,
        log: Logger,
    ) -> Result<Self, Error> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT, log)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        log: Logger,
    ) -> Result<Self, Error> {
        if base_url.is_empty() {
            return Err(Error::EmptyBaseUrl);
        }
        if api_key.is_empty() {
            return Err(Error::EmptyApiKey);
        }

        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::ClientBuilder::new().timeout(timeout).build()?;
        Ok(Client {
            client,
            log: log.new(o!("truenas_client base_url" => base_url.clone())),
            base_url,
            api_key: api_key.to_string(),
        })
    }

    /// Returns the full URL for an API-relative path.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }
}

#[async_trait]
impl Gateway for Client {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Bytes, Error> {
        let url = self.endpoint_url(path);
        debug!(self.log, "{} request to {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            let body = serde_json::to_vec(&body).map_err(Error::Encode)?;
            request = request.body(body);
        }

        Ok(send_and_check_ok(request).await?.bytes().await?)
    }
}

fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes)
        .map_err(|source| Error::Decode { path: path.to_string(), source })
}

fn to_body<T: serde::Serialize>(body: &T) -> Result<Value, Error> {
    serde_json::to_value(body).map_err(Error::Encode)
}

/// Typed calls for the VM and VM device endpoints, available on every
/// [`Gateway`].
#[async_trait]
pub trait TrueNasApi: Gateway {
    /// Issues a request and parses the JSON response.
    async fn send_json<T: DeserializeOwned + Send>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, Error> {
        let bytes = self.request(method, path, body).await?;
        decode(path, &bytes)
    }

    /// Fetches the full record of a VM.
    async fn vm_get(&self, vm_id: u64) -> Result<VmRecord, Error> {
        self.send_json(Method::GET, &format!("/vm/id/{}", vm_id), None).await
    }

    /// Asks the middleware to perform a power operation. The response
    /// payload differs between operations and releases, so it is discarded.
    async fn vm_power(
        &self,
        vm_id: u64,
        action: PowerAction,
    ) -> Result<(), Error> {
        let path = format!("/vm/id/{}/{}", vm_id, action);
        self.request(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn vm_device_create(
        &self,
        request: &DeviceCreateRequest,
    ) -> Result<DeviceRecord, Error> {
        let body = to_body(request)?;
        self.send_json(Method::POST, "/vm/device", Some(body)).await
    }

    async fn vm_device_get(
        &self,
        device_id: u64,
    ) -> Result<DeviceRecord, Error> {
        self.send_json(
            Method::GET,
            &format!("/vm/device/id/{}", device_id),
            None,
        )
        .await
    }

    async fn vm_device_update(
        &self,
        device_id: u64,
        request: &DeviceUpdateRequest,
    ) -> Result<DeviceRecord, Error> {
        let body = to_body(request)?;
        self.send_json(
            Method::PUT,
            &format!("/vm/device/id/{}", device_id),
            Some(body),
        )
        .await
    }

    async fn vm_device_delete(&self, device_id: u64) -> Result<(), Error> {
        let path = format!("/vm/device/id/{}", device_id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }
}

impl<G: Gateway + ?Sized> TrueNasApi for G {}
