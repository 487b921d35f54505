use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::Value;
use tracing::debug;

use super::{database::split_path, Database};
use crate::error::DatabaseError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Realtime-database REST client: every path maps to `{base}/{path}.json`.
#[derive(Debug, Clone)]
pub struct RestDatabase {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl RestDatabase {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, DatabaseError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| DatabaseError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DatabaseError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, DatabaseError> {
        let segments = split_path(path)?;
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| DatabaseError::InvalidUrl(self.base_url.to_string()))?;
            parts.pop_if_empty();
            if let Some((last, parents)) = segments.split_last() {
                parts.extend(parents.iter().copied());
                parts.push(&format!("{last}.json"));
            }
        }
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, DatabaseError> {
        let url = self.url_for(path)?;
        debug!(%method, path, "database request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DatabaseError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Database for RestDatabase {
    async fn get(&self, path: &str) -> Result<Option<Value>, DatabaseError> {
        let value: Value = self.send(Method::GET, path, None).await?.json().await?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), DatabaseError> {
        self.send(Method::PUT, path, Some(&value)).await?;
        Ok(())
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), DatabaseError> {
        if !partial.is_object() {
            return Err(DatabaseError::Shape {
                path: path.to_string(),
                reason: "update expects an object".into(),
            });
        }
        self.send(Method::PATCH, path, Some(&partial)).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), DatabaseError> {
        self.send(Method::DELETE, path, None).await?;
        Ok(())
    }
}
