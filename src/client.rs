//! HTTP client for a peer directory's surface.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::poller::ListingSource;
use crate::protocol::{DrainResponse, PeerListing, SignalAck, SignalMessage, SignalRequest, StatusReport};
use crate::relay::SignalRelay;

/// Everything except RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

#[derive(Clone, Debug)]
pub struct DirectoryClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl DirectoryClient {
    /// `base_url` is the directory root, e.g. `http://localhost:3002`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base =
            Url::parse(base_url).map_err(|e| Error::Config(format!("invalid directory url {}: {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base, timeout })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        response.json::<T>().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Http(err)
        }
    }

    pub async fn fetch_peers(&self) -> Result<PeerListing> {
        let url = self.endpoint("peers")?;
        let response = self.http.get(url).send().await.map_err(|e| self.classify(e))?;
        self.read_json(response).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let url = self.endpoint("status")?;
        let response = self.http.get(url).send().await.map_err(|e| self.classify(e))?;
        self.read_json(response).await
    }

    pub async fn post_signal(&self, request: &SignalRequest) -> Result<SignalAck> {
        let url = self.endpoint("signal")?;
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.read_json(response).await
    }

    pub async fn drain(&self, recipient: &str) -> Result<Vec<SignalMessage>> {
        let segment = utf8_percent_encode(recipient, PATH_SEGMENT).to_string();
        let url = self.endpoint(&format!("signal/{}", segment))?;
        let response = self.http.get(url).send().await.map_err(|e| self.classify(e))?;
        let drained: DrainResponse = self.read_json(response).await?;
        Ok(drained.messages)
    }
}

#[async_trait]
impl SignalRelay for DirectoryClient {
    async fn send_signal(&self, request: SignalRequest) -> Result<String> {
        let ack = self.post_signal(&request).await?;
        Ok(ack.message_id)
    }

    async fn drain_signals(&self, recipient: &str) -> Result<Vec<SignalMessage>> {
        self.drain(recipient).await
    }
}

#[async_trait]
impl ListingSource for DirectoryClient {
    async fn fetch_listing(&self) -> Result<PeerListing> {
        self.fetch_peers().await
    }

    async fn ping(&self) -> Result<()> {
        self.status().await.map(|_| ())
    }
}
