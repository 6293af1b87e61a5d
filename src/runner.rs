use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::PipelineError;
use crate::fetch::{PageFetcher, fetch_into_session};
use crate::heuristics::HeuristicRegistry;
use crate::model::{DEFAULT_MODEL, ModelClient};
use crate::pipeline::{BatchOutcome, ExtractionResult, PaginationResult, Pipeline, RawPage};
use crate::schema::{PAGE_URLS_KEY, RecordSchema};
use crate::store::{OutputKind, Session, SessionConfig, SessionStore, url_label};
use crate::usage::UsageTotals;

/// The reusable part of a scrape, stored as the session config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchPlan {
    pub urls: Vec<String>,
    pub fields: Vec<String>,
    pub model: String,
    pub use_pagination: bool,
    pub pagination_details: String,
}

impl LaunchPlan {
    pub fn to_config(&self) -> SessionConfig {
        let value = json!({
            "urls": self.urls,
            "fields": self.fields,
            "model": self.model,
            "use_pagination": self.use_pagination,
            "pagination_details": self.pagination_details,
        });
        match value {
            Value::Object(map) => map,
            _ => SessionConfig::new(),
        }
    }

    /// Rebuild a plan from a stored config; `model` is used when none was saved.
    pub fn from_config(config: &SessionConfig, model: &str) -> Self {
        Self {
            urls: string_list(config.get("urls")),
            fields: string_list(config.get("fields")),
            model: config
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_owned(),
            use_pagination: config
                .get("use_pagination")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            pagination_details: config
                .get("pagination_details")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Reuse this session; when `plan.urls` is empty its stored plan is replayed.
    pub session_id: Option<String>,
    /// Vendor label for a new session; defaults to the first URL's label.
    pub vendor: Option<String>,
    pub plan: LaunchPlan,
}

#[derive(Debug, Clone)]
pub struct PageBatchRequest {
    pub session_id: String,
    pub start_idx: usize,
    /// Inclusive.
    pub end_idx: usize,
    /// Falls back to the session's stored fields when empty.
    pub fields: Vec<String>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub pages: Vec<RawPage>,
    pub extraction: Option<BatchOutcome<ExtractionResult>>,
    pub pagination: Option<BatchOutcome<PaginationResult>>,
    pub totals: UsageTotals,
}

impl RunReport {
    pub fn skipped_count(&self) -> usize {
        self.extraction.as_ref().map_or(0, |o| o.skipped.len())
            + self.pagination.as_ref().map_or(0, |o| o.skipped.len())
    }
}

pub struct Runner {
    store: Arc<dyn SessionStore>,
    fetcher: Arc<dyn PageFetcher>,
    client: Arc<dyn ModelClient>,
    registry: Arc<HeuristicRegistry>,
    concurrency: usize,
}

impl Runner {
    pub fn new(
        store: Arc<dyn SessionStore>,
        fetcher: Arc<dyn PageFetcher>,
        client: Arc<dyn ModelClient>,
        registry: Arc<HeuristicRegistry>,
    ) -> Self {
        Self {
            store,
            fetcher,
            client,
            registry,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn pipeline(&self, model: &str) -> Pipeline {
        Pipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            model,
        )
        .with_concurrency(self.concurrency)
    }

    /// Fetch, extract, optionally paginate, then record a run summary in the
    /// session config.
    pub async fn launch(&self, request: LaunchRequest) -> anyhow::Result<RunReport> {
        let (session, plan) = self.resolve_session(request).await?;
        let schema = check_plan(&plan).with_context(|| format!("launch {}", session.id))?;

        tracing::info!(
            session_id = %session.id,
            urls = plan.urls.len(),
            model = %plan.model,
            pagination = plan.use_pagination,
            "launch"
        );
        let pages =
            fetch_into_session(self.store.as_ref(), self.fetcher.as_ref(), &session, &plan.urls)
                .await;

        let pipeline = self.pipeline(&plan.model);
        let extraction = match &schema {
            Some(schema) => Some(pipeline.extract_batch(&session, &pages, schema).await),
            None => None,
        };
        let pagination = if plan.use_pagination {
            Some(
                pipeline
                    .paginate_batch(&session, &pages, &plan.pagination_details)
                    .await,
            )
        } else {
            None
        };

        let mut totals = UsageTotals::default();
        for batch_totals in [
            extraction.as_ref().map(|o| &o.totals),
            pagination.as_ref().map(|o| &o.totals),
        ]
        .into_iter()
        .flatten()
        {
            totals.merge(batch_totals);
        }

        self.store
            .update_config(&session.id, run_summary(&totals))
            .await
            .context("record run summary")?;

        Ok(RunReport {
            session_id: session.id,
            pages,
            extraction,
            pagination,
            totals,
        })
    }

    async fn resolve_session(&self, request: LaunchRequest) -> anyhow::Result<(Session, LaunchPlan)> {
        let LaunchRequest {
            session_id,
            vendor,
            plan,
        } = request;

        let Some(session_id) = session_id else {
            let Some(first_url) = plan.urls.first() else {
                anyhow::bail!("at least one URL is required to start a new session");
            };
            check_plan(&plan)?;
            let vendor = vendor.unwrap_or_else(|| url_label(first_url));
            let session = self
                .store
                .create(&vendor, plan.to_config())
                .await
                .context("create session")?;
            return Ok((session, plan));
        };

        let session = self.load_session(&session_id).await?;
        if plan.urls.is_empty() {
            let stored = LaunchPlan::from_config(&session.config, &plan.model);
            return Ok((session, stored));
        }
        check_plan(&plan)?;
        let session = self
            .store
            .update_config(&session.id, plan.to_config())
            .await
            .context("store launch plan")?;
        Ok((session, plan))
    }

    async fn load_session(&self, session_id: &str) -> anyhow::Result<Session> {
        let session = self
            .store
            .load(session_id)
            .await
            .with_context(|| format!("load session {session_id}"))?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_owned()))?;
        Ok(session)
    }

    /// Extract an inclusive slice of the page URLs discovered by earlier
    /// pagination runs.
    pub async fn scrape_pages(&self, request: PageBatchRequest) -> anyhow::Result<RunReport> {
        let session = self.load_session(&request.session_id).await?;
        let discovered = self.discovered_page_urls(&session).await?;
        if discovered.is_empty() {
            anyhow::bail!(
                "session {} has no discovered page URLs; run with pagination first",
                session.id
            );
        }
        let (start, end) = (request.start_idx, request.end_idx);
        if start > end || end >= discovered.len() {
            anyhow::bail!(
                "page range {start}..={end} is out of bounds for {} discovered pages",
                discovered.len()
            );
        }
        let selected = discovered[start..=end].to_vec();

        let stored = LaunchPlan::from_config(&session.config, DEFAULT_MODEL);
        let fields = if request.fields.is_empty() {
            stored.fields
        } else {
            request.fields
        };
        let schema = RecordSchema::new(&fields).context("build record schema")?;
        let model = request.model.unwrap_or(stored.model);

        tracing::info!(
            session_id = %session.id,
            start,
            end,
            urls = selected.len(),
            "scraping discovered pages"
        );
        let pages =
            fetch_into_session(self.store.as_ref(), self.fetcher.as_ref(), &session, &selected)
                .await;
        let extraction = self
            .pipeline(&model)
            .extract_batch(&session, &pages, &schema)
            .await;
        let totals = extraction.totals;

        let batch_key = format!("page_batch_{}", chrono::Local::now().format("%Y%m%d%H%M"));
        let mut partial = SessionConfig::new();
        partial.insert(
            batch_key,
            json!({ "urls": selected, "start_idx": start, "end_idx": end }),
        );
        self.store
            .update_config(&session.id, partial)
            .await
            .context("record page batch")?;

        Ok(RunReport {
            session_id: session.id,
            pages,
            extraction: Some(extraction),
            pagination: None,
            totals,
        })
    }

    /// `page_urls` from every pagination output, in file order, deduplicated.
    pub async fn discovered_page_urls(&self, session: &Session) -> anyhow::Result<Vec<String>> {
        let files = self
            .store
            .list_files(session)
            .await
            .with_context(|| format!("list files of {}", session.id))?;

        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for name in files.iter().filter(|name| OutputKind::Pagination.matches(name)) {
            let path = session.path.join(name);
            let value = match self.store.read_json(&path).await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable pagination output");
                    continue;
                }
            };
            for url in string_list(value.get(PAGE_URLS_KEY)) {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }
}

/// Reject plans that would fetch pages without doing anything with them.
fn check_plan(plan: &LaunchPlan) -> anyhow::Result<Option<RecordSchema>> {
    if plan.urls.is_empty() {
        anyhow::bail!("no URLs to scrape");
    }
    let schema = if plan.fields.is_empty() {
        None
    } else {
        Some(RecordSchema::new(&plan.fields).context("build record schema")?)
    };
    if schema.is_none() && !plan.use_pagination {
        anyhow::bail!("nothing to do: pass at least one field or enable pagination");
    }
    Ok(schema)
}

fn run_summary(totals: &UsageTotals) -> SessionConfig {
    let mut summary = SessionConfig::new();
    summary.insert("scrape_completed".to_owned(), Value::Bool(true));
    summary.insert(
        "scrape_timestamp".to_owned(),
        Value::String(chrono::Local::now().to_rfc3339()),
    );
    summary.insert("total_cost".to_owned(), json!(totals.cost));
    summary.insert("total_input_tokens".to_owned(), json!(totals.input_tokens));
    summary.insert("total_output_tokens".to_owned(), json!(totals.output_tokens));
    summary
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::model::NoopModel;
    use crate::store::MemorySessionStore;

    struct CannedFetcher(HashMap<String, String>);

    #[async_trait]
    impl PageFetcher for CannedFetcher {
        async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
            self.0
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404: {url}"))
        }
    }

    const LISTING: &str = "https://weedmaps.com/brands/acme/products";

    fn listing_page(name: &str) -> String {
        format!(
            r#"<html><body>
              <div class="product-card"><h3 class="name">{name}</h3></div>
              <nav class="pagination">
                <a href="/brands/acme/products?page=2">2</a>
                <a href="/brands/acme/products?page=3">3</a>
              </nav>
            </body></html>"#
        )
    }

    fn runner(store: Arc<MemorySessionStore>) -> Runner {
        let fetcher = CannedFetcher(HashMap::from([
            (LISTING.to_owned(), listing_page("Page One")),
            (format!("{LISTING}?page=2"), listing_page("Page Two")),
            (format!("{LISTING}?page=3"), listing_page("Page Three")),
        ]));
        Runner::new(
            store,
            Arc::new(fetcher),
            Arc::new(NoopModel),
            Arc::new(HeuristicRegistry::builtin()),
        )
    }

    fn plan() -> LaunchPlan {
        LaunchPlan {
            urls: vec![LISTING.to_owned()],
            fields: vec!["name".to_owned()],
            model: DEFAULT_MODEL.to_owned(),
            use_pagination: true,
            pagination_details: String::new(),
        }
    }

    #[tokio::test]
    async fn launch_creates_session_and_records_summary() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let runner = runner(Arc::clone(&store));

        let report = runner
            .launch(LaunchRequest {
                session_id: None,
                vendor: None,
                plan: plan(),
            })
            .await?;

        assert!(report.session_id.starts_with("session_acme_"));
        let extraction = report.extraction.as_ref().expect("extraction ran");
        assert_eq!(extraction.results[0].records[0].get("name"), Some("Page One"));
        let pagination = report.pagination.as_ref().expect("pagination ran");
        assert_eq!(pagination.results[0].page_urls.len(), 2);
        assert_eq!(report.skipped_count(), 0);

        let session = store.load(&report.session_id).await?.expect("session");
        assert_eq!(session.config.get("scrape_completed"), Some(&json!(true)));
        assert_eq!(session.config.get("total_input_tokens"), Some(&json!(0)));
        assert_eq!(LaunchPlan::from_config(&session.config, "other"), plan());
        Ok(())
    }

    #[tokio::test]
    async fn scrape_pages_extracts_selected_range() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let runner = runner(Arc::clone(&store));
        let report = runner
            .launch(LaunchRequest {
                session_id: None,
                vendor: Some("acme".to_owned()),
                plan: plan(),
            })
            .await?;

        let session = store.load(&report.session_id).await?.expect("session");
        assert_eq!(
            runner.discovered_page_urls(&session).await?,
            [format!("{LISTING}?page=2"), format!("{LISTING}?page=3")]
        );

        let pages = runner
            .scrape_pages(PageBatchRequest {
                session_id: report.session_id.clone(),
                start_idx: 1,
                end_idx: 1,
                fields: Vec::new(),
                model: None,
            })
            .await?;
        let extraction = pages.extraction.as_ref().expect("extraction ran");
        assert_eq!(extraction.results.len(), 1);
        assert_eq!(extraction.results[0].records[0].get("name"), Some("Page Three"));

        let session = store.load(&report.session_id).await?.expect("session");
        let batch = session
            .config
            .iter()
            .find(|(key, _)| key.starts_with("page_batch_"))
            .map(|(_, value)| value.clone())
            .expect("page batch recorded");
        assert_eq!(
            batch,
            json!({ "urls": [format!("{LISTING}?page=3")], "start_idx": 1, "end_idx": 1 })
        );

        let err = runner
            .scrape_pages(PageBatchRequest {
                session_id: report.session_id,
                start_idx: 0,
                end_idx: 5,
                fields: Vec::new(),
                model: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_field_list_without_pagination_is_rejected() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let runner = runner(Arc::clone(&store));
        let mut plan = plan();
        plan.fields.clear();
        plan.use_pagination = false;

        let err = runner
            .launch(LaunchRequest {
                session_id: None,
                vendor: None,
                plan,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nothing to do"));
        assert!(store.list_sessions().await?.is_empty());
        Ok(())
    }
}
