//! Per-URL batch driver for extraction and pagination.
//!
//! Every URL is handled independently: read raw content, run the fallback
//! chain, persist the outcome. A failure for one URL is recorded in
//! [`BatchOutcome::skipped`] and never aborts the rest of the batch.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::ser::SerializeStruct as _;
use tokio::task::JoinSet;

use crate::chain::{FallbackChain, Page, Provenance};
use crate::error::PipelineError;
use crate::heuristics::{HeuristicRegistry, ListingCardHeuristic, PaginationLinkHeuristic};
use crate::model::{ModelClient, ModelPaginationStrategy, ModelRecordStrategy};
use crate::schema::{PaginationQuery, Record, RecordSchema};
use crate::store::{Session, SessionStore};
use crate::usage::{Usage, UsageTotals};

/// A URL paired with the raw content fetched for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawPage {
    pub url: String,
    pub raw_path: Option<PathBuf>,
}

impl RawPage {
    pub fn new(url: impl Into<String>, raw_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            raw_path: Some(raw_path.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub url: String,
    pub source_path: PathBuf,
    /// `None` when persisting the result failed.
    pub output_path: Option<PathBuf>,
    pub records: Vec<Record>,
    pub provenance: Provenance,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginationResult {
    pub url: String,
    pub source_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub page_urls: Vec<String>,
    pub provenance: Provenance,
    /// Which heuristic link strategy matched, when a heuristic won.
    pub strategy: Option<&'static str>,
    pub usage: Usage,
}

#[derive(Debug)]
pub struct SkippedUrl {
    pub url: String,
    pub error: PipelineError,
}

impl Serialize for SkippedUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SkippedUrl", 2)?;
        state.serialize_field("url", &self.url)?;
        state.serialize_field("reason", &self.error.to_string())?;
        state.end()
    }
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome<R> {
    pub totals: UsageTotals,
    pub results: Vec<R>,
    pub skipped: Vec<SkippedUrl>,
}

impl<R> Default for BatchOutcome<R> {
    fn default() -> Self {
        Self {
            totals: UsageTotals::default(),
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl<R> BatchOutcome<R> {
    /// `(total_input_tokens, total_output_tokens, total_cost, results)`.
    pub fn into_parts(self) -> (u64, u64, f64, Vec<R>) {
        (
            self.totals.input_tokens,
            self.totals.output_tokens,
            self.totals.cost,
            self.results,
        )
    }
}

trait Accounted {
    fn usage(&self) -> &Usage;
    fn provenance(&self) -> Provenance;
}

impl Accounted for ExtractionResult {
    fn usage(&self) -> &Usage {
        &self.usage
    }

    fn provenance(&self) -> Provenance {
        self.provenance
    }
}

impl Accounted for PaginationResult {
    fn usage(&self) -> &Usage {
        &self.usage
    }

    fn provenance(&self) -> Provenance {
        self.provenance
    }
}

pub struct Pipeline {
    store: Arc<dyn SessionStore>,
    records: Arc<FallbackChain<RecordSchema, Record>>,
    pages: Arc<FallbackChain<PaginationQuery, String>>,
    concurrency: usize,
}

impl Pipeline {
    /// Heuristics from `registry` first, then `client` with `model` as the fallback.
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<HeuristicRegistry>,
        client: Arc<dyn ModelClient>,
        model: &str,
    ) -> Self {
        let records = FallbackChain::new(Arc::new(ModelRecordStrategy::new(
            Arc::clone(&client),
            model,
        )))
        .with_heuristic(Arc::new(ListingCardHeuristic::new(Arc::clone(&registry))));
        let pages = FallbackChain::new(Arc::new(ModelPaginationStrategy::new(client, model)))
            .with_heuristic(Arc::new(PaginationLinkHeuristic::new(registry)));
        Self {
            store,
            records: Arc::new(records),
            pages: Arc::new(pages),
            concurrency: 1,
        }
    }

    /// Process up to `concurrency` URLs at a time. Results keep input order.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn extract_batch(
        &self,
        session: &Session,
        pages: &[RawPage],
        schema: &RecordSchema,
    ) -> BatchOutcome<ExtractionResult> {
        let store = Arc::clone(&self.store);
        let chain = Arc::clone(&self.records);
        let session = Arc::new(session.clone());
        let schema = Arc::new(schema.clone());
        tracing::info!(session_id = %session.id, urls = pages.len(), "extraction batch started");

        let outcome = drive(pages, self.concurrency, move |page| {
            let store = Arc::clone(&store);
            let chain = Arc::clone(&chain);
            let session = Arc::clone(&session);
            let schema = Arc::clone(&schema);
            async move { extract_one(store.as_ref(), &chain, &session, &schema, page).await }
        })
        .await;
        log_outcome("extraction", &outcome);
        outcome
    }

    pub async fn paginate_batch(
        &self,
        session: &Session,
        pages: &[RawPage],
        indications: &str,
    ) -> BatchOutcome<PaginationResult> {
        let store = Arc::clone(&self.store);
        let chain = Arc::clone(&self.pages);
        let session = Arc::new(session.clone());
        let query = Arc::new(PaginationQuery::new(indications));
        tracing::info!(session_id = %session.id, urls = pages.len(), "pagination batch started");

        let outcome = drive(pages, self.concurrency, move |page| {
            let store = Arc::clone(&store);
            let chain = Arc::clone(&chain);
            let session = Arc::clone(&session);
            let query = Arc::clone(&query);
            async move { paginate_one(store.as_ref(), &chain, &session, &query, page).await }
        })
        .await;
        log_outcome("pagination", &outcome);
        outcome
    }
}

async fn read_page(store: &dyn SessionStore, page: &RawPage) -> Result<(PathBuf, String), PipelineError> {
    let missing = || PipelineError::FetchMissing {
        url: page.url.clone(),
    };
    let path = page.raw_path.clone().ok_or_else(missing)?;
    let raw = store.read_raw(&path).await;
    if raw.trim().is_empty() {
        return Err(missing());
    }
    Ok((path, raw))
}

async fn extract_one(
    store: &dyn SessionStore,
    chain: &FallbackChain<RecordSchema, Record>,
    session: &Session,
    schema: &RecordSchema,
    page: RawPage,
) -> Result<ExtractionResult, PipelineError> {
    let (source_path, raw) = read_page(store, &page).await?;
    let accepted = chain
        .run(
            &Page {
                url: &page.url,
                raw: &raw,
            },
            schema,
        )
        .await?;

    let output_path = match store.save_extraction(session, &page.url, &accepted.items).await {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::warn!(url = %page.url, error = %err, "failed to persist extraction result");
            None
        }
    };
    Ok(ExtractionResult {
        url: page.url,
        source_path,
        output_path,
        records: accepted.items,
        provenance: accepted.provenance,
        usage: accepted.usage,
    })
}

async fn paginate_one(
    store: &dyn SessionStore,
    chain: &FallbackChain<PaginationQuery, String>,
    session: &Session,
    query: &PaginationQuery,
    page: RawPage,
) -> Result<PaginationResult, PipelineError> {
    let (source_path, raw) = read_page(store, &page).await?;
    let accepted = chain
        .run(
            &Page {
                url: &page.url,
                raw: &raw,
            },
            query,
        )
        .await?;

    let output_path = match store.save_pagination(session, &page.url, &accepted.items).await {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::warn!(url = %page.url, error = %err, "failed to persist pagination result");
            None
        }
    };
    Ok(PaginationResult {
        url: page.url,
        source_path,
        output_path,
        page_urls: accepted.items,
        provenance: accepted.provenance,
        strategy: accepted.detail,
        usage: accepted.usage,
    })
}

/// Run `work` for every page with at most `concurrency` in flight and collect
/// the outcomes in input order.
async fn drive<R, F, Fut>(pages: &[RawPage], concurrency: usize, work: F) -> BatchOutcome<R>
where
    R: Accounted + Send + 'static,
    F: Fn(RawPage) -> Fut,
    Fut: Future<Output = Result<R, PipelineError>> + Send + 'static,
{
    let mut join_set = JoinSet::new();
    let mut finished = Vec::with_capacity(pages.len());
    let mut next_idx = 0usize;

    while next_idx < pages.len() || !join_set.is_empty() {
        while next_idx < pages.len() && join_set.len() < concurrency {
            let idx = next_idx;
            let task = work(pages[idx].clone());
            join_set.spawn(async move { (idx, task.await) });
            next_idx += 1;
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        match joined {
            Ok(done) => finished.push(done),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => tracing::error!(error = %err, "batch task cancelled"),
        }
    }
    finished.sort_by_key(|(idx, _)| *idx);

    let mut outcome = BatchOutcome::default();
    for (idx, result) in finished {
        match result {
            Ok(result) => {
                match result.provenance() {
                    Provenance::Model => outcome.totals.record_model_call(result.usage()),
                    Provenance::Heuristic => outcome.totals.add(result.usage()),
                }
                outcome.results.push(result);
            }
            Err(error) => {
                let url = pages[idx].url.clone();
                let spent = error.spent_usage();
                if !spent.is_zero() {
                    outcome.totals.record_model_call(&spent);
                }
                tracing::warn!(url = %url, error = %error, "skipping url");
                outcome.skipped.push(SkippedUrl { url, error });
            }
        }
    }
    outcome
}

fn log_outcome<R>(kind: &'static str, outcome: &BatchOutcome<R>) {
    tracing::info!(
        kind,
        results = outcome.results.len(),
        skipped = outcome.skipped.len(),
        model_calls = outcome.totals.model_calls,
        input_tokens = outcome.totals.input_tokens,
        output_tokens = outcome.totals.output_tokens,
        cost = outcome.totals.cost,
        "batch finished"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::model::{ModelReply, ModelRequest, NoopModel};
    use crate::store::{MemorySessionStore, SessionConfig};

    const CARD_PAGE: &str = r#"<html><body>
        <div class="product-card"><h3 class="name">Blue Dream</h3><span class="price">$45</span></div>
        <div class="product-card"><h3 class="name">OG Kush</h3><span class="price">$40</span></div>
    </body></html>"#;

    /// Answers with one listing named after the request input. Fails when the
    /// input contains `boom` and answers off-schema on `garbled`. Later URLs
    /// answer faster.
    struct ScriptedModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            if request.input.contains("boom") {
                return Err(PipelineError::ModelCall("upstream 500".to_owned()));
            }
            if request.input.contains("garbled") {
                return Ok(ModelReply {
                    value: json!({ "items": [] }),
                    usage: Usage::new(500, 50, 0.25),
                });
            }
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(call * 10))).await;
            Ok(ModelReply {
                value: json!({ "listings": [{ "name": request.input.trim() }] }),
                usage: Usage::new(100, 10, 0.5),
            })
        }
    }

    async fn seeded(
        store: &MemorySessionStore,
        pages: &[(&str, &str)],
    ) -> anyhow::Result<(Session, Vec<RawPage>)> {
        let session = store.create("acme", SessionConfig::new()).await?;
        let mut raw_pages = Vec::new();
        for (url, raw) in pages {
            let path = store.save_raw(&session, url, raw).await?;
            raw_pages.push(RawPage::new(*url, path));
        }
        Ok((session, raw_pages))
    }

    fn pipeline(store: Arc<MemorySessionStore>, client: Arc<dyn ModelClient>) -> Pipeline {
        Pipeline::new(store, Arc::new(HeuristicRegistry::builtin()), client, "gpt-4o-mini")
    }

    #[tokio::test]
    async fn heuristic_success_skips_the_model() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let (session, pages) =
            seeded(&store, &[("https://weedmaps.com/brands/acme/products", CARD_PAGE)]).await?;
        let model = Arc::new(ScriptedModel { calls: AtomicUsize::new(0) });
        let pipeline = pipeline(Arc::clone(&store), model.clone());

        let schema = RecordSchema::new(["product_name", "price"])?;
        let outcome = pipeline.extract_batch(&session, &pages, &schema).await;

        assert!(outcome.skipped.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.totals, UsageTotals::default());
        let result = &outcome.results[0];
        assert_eq!(result.provenance, Provenance::Heuristic);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[1].get("product_name"), Some("OG Kush"));

        let output = result.output_path.as_ref().expect("persisted");
        assert_eq!(
            store.read_json(output).await?,
            json!({ "listings": [
                { "product_name": "Blue Dream", "price": "$45" },
                { "product_name": "OG Kush", "price": "$40" },
            ]})
        );
        Ok(())
    }

    #[tokio::test]
    async fn model_failures_and_missing_raw_are_skipped() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let (session, mut pages) = seeded(
            &store,
            &[
                ("https://example.com/a", "alpha"),
                ("https://example.com/b", "boom"),
                ("https://example.com/c", "gamma"),
            ],
        )
        .await?;
        pages.insert(
            1,
            RawPage {
                url: "https://example.com/never-fetched".to_owned(),
                raw_path: None,
            },
        );
        let model = Arc::new(ScriptedModel { calls: AtomicUsize::new(0) });
        let pipeline = pipeline(Arc::clone(&store), model.clone());

        let schema = RecordSchema::new(["name"])?;
        let outcome = pipeline.extract_batch(&session, &pages, &schema).await;

        let urls = outcome.results.iter().map(|r| r.url.as_str()).collect::<Vec<_>>();
        assert_eq!(urls, ["https://example.com/a", "https://example.com/c"]);
        assert_eq!(outcome.results[1].records[0].get("name"), Some("gamma"));
        assert_eq!(outcome.results[1].provenance, Provenance::Model);

        let skipped = outcome.skipped.iter().map(|s| s.url.as_str()).collect::<Vec<_>>();
        assert_eq!(skipped, ["https://example.com/never-fetched", "https://example.com/b"]);
        assert!(matches!(outcome.skipped[0].error, PipelineError::FetchMissing { .. }));
        assert!(matches!(outcome.skipped[1].error, PipelineError::ModelCall(_)));

        let (input, output, cost, results) = outcome.into_parts();
        assert_eq!((input, output), (200, 20));
        assert!((cost - 1.0).abs() < 1e-12);
        assert_eq!(results.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_model_answer_still_counts_toward_totals() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let (session, pages) = seeded(
            &store,
            &[
                ("https://example.com/a", "garbled"),
                ("https://example.com/b", "boom"),
            ],
        )
        .await?;
        let model = Arc::new(ScriptedModel { calls: AtomicUsize::new(0) });
        let pipeline = pipeline(Arc::clone(&store), model.clone());

        let schema = RecordSchema::new(["name"])?;
        let outcome = pipeline.extract_batch(&session, &pages, &schema).await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.skipped.len(), 2);
        assert!(matches!(outcome.skipped[0].error, PipelineError::Parse { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.totals.input_tokens, 500);
        assert_eq!(outcome.totals.output_tokens, 50);
        assert!((outcome.totals.cost - 0.25).abs() < 1e-12);
        assert_eq!(outcome.totals.model_calls, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_batches_keep_input_order() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let inputs = ["one", "two", "three", "four"];
        let urls = inputs
            .iter()
            .map(|name| format!("https://example.com/{name}"))
            .collect::<Vec<_>>();
        let seeds = urls
            .iter()
            .zip(inputs)
            .map(|(url, name)| (url.as_str(), name))
            .collect::<Vec<_>>();
        let (session, pages) = seeded(&store, &seeds).await?;
        let model = Arc::new(ScriptedModel { calls: AtomicUsize::new(0) });
        let pipeline = pipeline(Arc::clone(&store), model).with_concurrency(4);

        let schema = RecordSchema::new(["name"])?;
        let outcome = pipeline.extract_batch(&session, &pages, &schema).await;

        let names = outcome
            .results
            .iter()
            .map(|r| r.records[0].get("name").unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(names, inputs);
        assert_eq!(outcome.totals.model_calls, 4);
        Ok(())
    }

    #[tokio::test]
    async fn store_write_failure_keeps_the_result() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let (session, pages) =
            seeded(&store, &[("https://weedmaps.com/brands/acme/products", CARD_PAGE)]).await?;
        store.set_fail_writes(true);
        let pipeline = pipeline(Arc::clone(&store), Arc::new(NoopModel));

        let outcome = pipeline
            .paginate_batch(&session, &pages, "")
            .await;
        assert!(outcome.skipped.is_empty());
        let result = &outcome.results[0];
        assert!(result.output_path.is_none());
        assert!(result.page_urls.is_empty());
        assert_eq!(result.provenance, Provenance::Model);
        assert_eq!(result.strategy, None);
        Ok(())
    }

    #[tokio::test]
    async fn pagination_heuristic_reports_strategy() -> anyhow::Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let raw = r#"<nav class="pagination"><a href="/brands/acme/products?page=2">2</a></nav>"#;
        let (session, pages) =
            seeded(&store, &[("https://weedmaps.com/brands/acme/products", raw)]).await?;
        let pipeline = pipeline(Arc::clone(&store), Arc::new(NoopModel));

        let outcome = pipeline.paginate_batch(&session, &pages, "next buttons").await;
        let result = &outcome.results[0];
        assert_eq!(result.provenance, Provenance::Heuristic);
        assert_eq!(result.strategy, Some("container"));
        assert_eq!(
            result.page_urls,
            ["https://weedmaps.com/brands/acme/products?page=2"]
        );
        let output = result.output_path.as_ref().expect("persisted");
        assert!(output.to_string_lossy().ends_with("_acme_pagination.json"));
        Ok(())
    }
}
