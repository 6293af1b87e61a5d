use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use url::Url;

use crate::pipeline::RawPage;
use crate::store::{Session, SessionStore};

const BROWSER_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) ",
    "Chrome/124.0 Safari/537.36 pagesift/",
    env!("CARGO_PKG_VERSION")
);

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build page fetch http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url}: HTTP {status}");
        }
        response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))
    }
}

/// Fetch every URL and store its body as raw content.
///
/// Always re-fetches. A URL that fails to fetch, returns an empty body, or
/// cannot be saved is logged and comes back with `raw_path: None`, which the
/// batch later reports as skipped.
pub async fn fetch_into_session(
    store: &dyn SessionStore,
    fetcher: &dyn PageFetcher,
    session: &Session,
    urls: &[String],
) -> Vec<RawPage> {
    let mut pages = Vec::with_capacity(urls.len());
    for url in urls {
        let raw_path = match fetch_one(store, fetcher, session, url).await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(url = %url, error = %format!("{err:#}"), "fetch failed");
                None
            }
        };
        pages.push(RawPage {
            url: url.clone(),
            raw_path,
        });
    }
    pages
}

async fn fetch_one(
    store: &dyn SessionStore,
    fetcher: &dyn PageFetcher,
    session: &Session,
    url: &str,
) -> anyhow::Result<Option<std::path::PathBuf>> {
    let parsed = Url::parse(url).with_context(|| format!("parse url: {url}"))?;
    let body = fetcher.fetch(&parsed).await?;
    if body.trim().is_empty() {
        tracing::warn!(url = %url, "empty response body");
        return Ok(None);
    }
    let path = store
        .save_raw(session, url, &body)
        .await
        .context("save raw content")?;
    tracing::info!(url = %url, path = %path.display(), bytes = body.len(), "fetched");
    Ok(Some(path))
}
