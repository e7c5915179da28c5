use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use http_cache_reqwest::{CACacheManager, Cache, CacheMode, HttpCache, HttpCacheOptions};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::source::{CONNECT_TIMEOUT, READ_TIMEOUT, TOTAL_TIMEOUT};

pub fn http_client(cache_dir: Option<PathBuf>) -> Result<ClientWithMiddleware> {
    let builder = ClientBuilder::new(
        reqwest::Client::builder()
            .user_agent(concat!("media-monitor/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .context("could not create an HTTP client")?,
    );

    let builder = if let Some(path) = cache_dir {
        debug!("Using an HTTP cache at {}", path.display());
        builder.with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager { path },
            options: HttpCacheOptions::default(),
        }))
    } else {
        debug!("HTTP caching is disabled");
        builder
    };

    Ok(builder.build())
}

/// Sends the request and decodes a successful JSON response.
pub async fn get_json<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(Into::into)
        .and_then(|r| r.error_for_status().context("server returned an error"))
        .with_context(|| anyhow!("could not fetch {what}"))?;
    trace!(url = %response.url(), "Received a response");

    response
        .json()
        .await
        .with_context(|| anyhow!("could not decode {what}"))
}
