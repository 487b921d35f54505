use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use tracing::debug;

use super::ContentStore;
use crate::error::StoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PinataCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// IPFS pinning service client: pins through the pinning API and reads back
/// through the public gateway.
#[derive(Debug, Clone)]
pub struct PinataStore {
    client: Client,
    api_url: String,
    gateway_url: String,
    credentials: Option<PinataCredentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinResponse {
    ipfs_hash: String,
}

impl PinataStore {
    pub fn new(
        api_url: impl Into<String>,
        gateway_url: impl Into<String>,
        credentials: Option<PinataCredentials>,
    ) -> Result<Self, StoreError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(credentials) => builder
                .header("pinata_api_key", &credentials.api_key)
                .header("pinata_secret_api_key", &credentials.api_secret),
            None => builder,
        }
    }

    fn pin_endpoint(&self) -> String {
        format!("{}/pinning/pinFileToIPFS", self.api_url)
    }

    /// Checks the configured keys against the pinning API.
    pub async fn test_authentication(&self) -> Result<(), StoreError> {
        let url = format!("{}/data/testAuthentication", self.api_url);
        let response = self.authorize(self.client.get(&url)).send().await?;
        check_status(&url, response).map(|_| ())
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(StoreError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

#[async_trait]
impl ContentStore for PinataStore {
    async fn pin(&self, bytes: Bytes, name: &str) -> Result<String, StoreError> {
        let url = self.pin_endpoint();
        let metadata = serde_json::json!({ "name": name }).to_string();
        let part = Part::bytes(bytes.to_vec()).file_name(name.to_string());
        let form = Form::new().part("file", part).text("pinataMetadata", metadata);

        let response = self
            .authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await?;
        let reply: PinResponse = check_status(&url, response)?.json().await?;
        if reply.ipfs_hash.is_empty() {
            return Err(StoreError::Protocol("pin response carried no IpfsHash".into()));
        }
        debug!(content_id = %reply.ipfs_hash, name, "pinned content");
        Ok(reply.ipfs_hash)
    }

    async fn fetch(&self, content_id: &str) -> Result<Bytes, StoreError> {
        let url = self.gateway_url(content_id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = check_status(&url, response).map_err(|err| match err {
            StoreError::NotFound(_) => StoreError::NotFound(content_id.to_string()),
            other => other,
        })?;
        Ok(response.bytes().await?)
    }

    fn gateway_url(&self, content_id: &str) -> String {
        format!("{}/ipfs/{}", self.gateway_url, content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoints_without_double_slashes() {
        let store = PinataStore::new(
            "https://api.pinata.cloud/",
            "https://gateway.pinata.cloud/",
            None,
        )
        .unwrap();
        assert_eq!(
            store.gateway_url("bafk123"),
            "https://gateway.pinata.cloud/ipfs/bafk123"
        );
        assert_eq!(
            store.pin_endpoint(),
            "https://api.pinata.cloud/pinning/pinFileToIPFS"
        );
    }

    #[test]
    fn parses_pin_reply() {
        let reply: PinResponse = serde_json::from_str(
            r#"{"IpfsHash":"QmXyz","PinSize":1024,"Timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(reply.ipfs_hash, "QmXyz");
    }
}
