use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use super::{CatalogClient, CatalogIndex, CatalogPage, RemoteCursorClient};
use crate::{
    config::CatalogConfig,
    error::{InsightsError, Result},
};

#[derive(Deserialize)]
struct CursorDocument {
    value: DateTime<Utc>,
}

/// Fetches catalog documents and remote cursors over HTTP.
#[derive(Clone, Debug)]
pub struct HttpCatalogClient {
    http: reqwest::Client,
    index_url: String,
    flat_container_cursor_url: String,
}

impl HttpCatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        for (name, value) in [
            ("catalog.index_url", &config.index_url),
            ("catalog.flat_container_cursor_url", &config.flat_container_cursor_url),
        ] {
            Url::parse(value).map_err(|err| {
                InsightsError::InvalidArgument(format!(
                    "{name} `{value}` is not a valid URL: {err}"
                ))
            })?;
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: &CatalogConfig) -> Self {
        Self {
            http,
            index_url: config.index_url.clone(),
            flat_container_cursor_url: config.flat_container_cursor_url.clone(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url, "fetching catalog document");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(InsightsError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_owned(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn get_index(&self) -> Result<CatalogIndex> {
        self.get_json(&self.index_url).await
    }

    async fn get_page(&self, url: &str) -> Result<CatalogPage> {
        let mut page: CatalogPage = self.get_json(url).await?;
        if page.url.is_empty() {
            page.url = url.to_owned();
        }
        Ok(page)
    }
}

#[async_trait]
impl RemoteCursorClient for HttpCatalogClient {
    async fn get_flat_container_cursor(&self) -> Result<DateTime<Utc>> {
        let cursor: CursorDocument =
            self.get_json(&self.flat_container_cursor_url).await?;
        Ok(cursor.value)
    }
}
