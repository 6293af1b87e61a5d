//! Wiring from parsed CLI arguments to the store, pipeline and runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;

use crate::cli::{
    ExtractArgs, FetchArgs, ModelArgs, ModelEngine, PaginateArgs, RunArgs, ScrapePagesArgs,
    SessionArgs, SessionCommand, SessionNewArgs, SessionSetArgs, StoreArgs,
};
use crate::error::PipelineError;
use crate::fetch::{HttpFetcher, fetch_into_session};
use crate::heuristics::HeuristicRegistry;
use crate::model::{ModelClient, NoopModel, Pricing};
use crate::openai::OpenAiModel;
use crate::pipeline::{Pipeline, RawPage};
use crate::runner::{LaunchPlan, LaunchRequest, PageBatchRequest, Runner};
use crate::schema::RecordSchema;
use crate::store::{LocalFsSessionStore, Session, SessionConfig, SessionStore, url_label};

pub async fn session(command: SessionCommand) -> anyhow::Result<()> {
    match command {
        SessionCommand::New(args) => session_new(args).await,
        SessionCommand::List(args) => {
            let store = open_store(&args).await?;
            for id in store.list_sessions().await.context("list sessions")? {
                println!("{id}");
            }
            Ok(())
        }
        SessionCommand::Show(args) => {
            let (_, session) = open_session(&args).await?;
            print_json(&session)
        }
        SessionCommand::Files(args) => {
            let (store, session) = open_session(&args).await?;
            for name in store.list_files(&session).await.context("list files")? {
                println!("{name}");
            }
            Ok(())
        }
        SessionCommand::Set(args) => session_set(args).await,
    }
}

async fn session_new(args: SessionNewArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store).await?;
    let plan = LaunchPlan {
        urls: args.urls,
        fields: args.fields,
        model: args.model,
        use_pagination: args.paginate,
        pagination_details: args.pagination_details,
    };
    let vendor = args
        .vendor
        .or_else(|| plan.urls.first().map(|url| url_label(url)))
        .unwrap_or_else(|| "unknown".to_owned());
    let session = store
        .create(&vendor, plan.to_config())
        .await
        .context("create session")?;
    println!("{}", session.id);
    Ok(())
}

async fn session_set(args: SessionSetArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store).await?;
    let partial: SessionConfig =
        serde_json::from_str(&args.json).context("--json must be a JSON object")?;
    let session = store
        .update_config(&args.session, partial)
        .await
        .with_context(|| format!("update config of {}", args.session))?;
    print_json(&session)
}

pub async fn fetch(args: FetchArgs) -> anyhow::Result<()> {
    let (store, session) = open_session(&SessionArgs {
        store: args.store,
        session: args.session,
    })
    .await?;
    let fetcher = HttpFetcher::new(Duration::from_secs(args.fetch_timeout_secs))?;
    let pages = fetch_into_session(store.as_ref(), &fetcher, &session, &args.urls).await;
    print_json(&pages)
}

pub async fn extract(args: ExtractArgs) -> anyhow::Result<()> {
    let schema = RecordSchema::new(&args.fields).context("build record schema")?;
    let (store, session) = open_session(&SessionArgs {
        store: args.store,
        session: args.session,
    })
    .await?;
    let pages = paired_pages(args.urls, args.raw_paths)?;
    let model = args.model.model_or_default();
    let pipeline = build_pipeline(Arc::clone(&store), &args.model, &model)?;

    let outcome = pipeline.extract_batch(&session, &pages, &schema).await;
    print_json(&outcome)
}

pub async fn paginate(args: PaginateArgs) -> anyhow::Result<()> {
    let (store, session) = open_session(&SessionArgs {
        store: args.store,
        session: args.session,
    })
    .await?;
    let pages = paired_pages(args.urls, args.raw_paths)?;
    let model = args.model.model_or_default();
    let pipeline = build_pipeline(Arc::clone(&store), &args.model, &model)?;

    let outcome = pipeline
        .paginate_batch(&session, &pages, &args.indications)
        .await;
    print_json(&outcome)
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = Arc::new(open_store(&args.store).await?);
    let runner = build_runner(store, &args.model, args.fetch_timeout_secs)?;
    let request = LaunchRequest {
        session_id: args.session,
        vendor: args.vendor,
        plan: LaunchPlan {
            urls: args.urls,
            fields: args.fields,
            model: args.model.model_or_default(),
            use_pagination: args.paginate,
            pagination_details: args.pagination_details,
        },
    };

    let report = runner.launch(request).await?;
    if report.skipped_count() > 0 {
        tracing::warn!(skipped = report.skipped_count(), "some URLs produced no output");
    }
    print_json(&report)
}

pub async fn scrape_pages(args: ScrapePagesArgs) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = Arc::new(open_store(&args.store).await?);
    let runner = build_runner(store, &args.model, args.fetch_timeout_secs)?;
    let report = runner
        .scrape_pages(PageBatchRequest {
            session_id: args.session,
            start_idx: args.start,
            end_idx: args.end,
            fields: args.fields,
            model: args.model.model.clone(),
        })
        .await?;
    print_json(&report)
}

async fn open_store(args: &StoreArgs) -> anyhow::Result<LocalFsSessionStore> {
    let dir = args.resolve();
    LocalFsSessionStore::open(&dir)
        .await
        .with_context(|| format!("open session store {}", dir.display()))
}

async fn open_session(args: &SessionArgs) -> anyhow::Result<(Arc<dyn SessionStore>, Session)> {
    let store: Arc<dyn SessionStore> = Arc::new(open_store(&args.store).await?);
    let session = store
        .load(&args.session)
        .await
        .with_context(|| format!("load session {}", args.session))?
        .ok_or_else(|| PipelineError::SessionNotFound(args.session.clone()))?;
    Ok((store, session))
}

fn paired_pages(urls: Vec<String>, raw_paths: Vec<PathBuf>) -> anyhow::Result<Vec<RawPage>> {
    if urls.len() != raw_paths.len() {
        anyhow::bail!(
            "--url and --raw must be given the same number of times ({} vs {})",
            urls.len(),
            raw_paths.len()
        );
    }
    Ok(urls
        .into_iter()
        .zip(raw_paths)
        .map(|(url, path)| RawPage::new(url, path))
        .collect())
}

fn registry(args: &ModelArgs) -> Arc<HeuristicRegistry> {
    Arc::new(HeuristicRegistry::builtin().with_listing_hosts(args.heuristic_domains.iter().cloned()))
}

fn model_client(args: &ModelArgs, model: &str) -> anyhow::Result<Arc<dyn ModelClient>> {
    match args.engine {
        ModelEngine::Noop => Ok(Arc::new(NoopModel)),
        ModelEngine::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            let pricing = match (args.input_price_per_mtok, args.output_price_per_mtok) {
                (None, None) => None,
                (input, output) => {
                    let base = Pricing::for_model(model).unwrap_or(Pricing::FREE);
                    Some(Pricing::new(
                        input.unwrap_or(base.input_per_mtok),
                        output.unwrap_or(base.output_per_mtok),
                    ))
                }
            };
            let client = OpenAiModel::new(
                &args.openai_base_url,
                api_key,
                Duration::from_secs(args.openai_timeout_secs),
            )?
            .with_pricing(pricing);
            Ok(Arc::new(client))
        }
    }
}

fn build_pipeline(
    store: Arc<dyn SessionStore>,
    args: &ModelArgs,
    model: &str,
) -> anyhow::Result<Pipeline> {
    let client = model_client(args, model)?;
    Ok(Pipeline::new(store, registry(args), client, model).with_concurrency(args.concurrency))
}

fn build_runner(
    store: Arc<dyn SessionStore>,
    args: &ModelArgs,
    fetch_timeout_secs: u64,
) -> anyhow::Result<Runner> {
    let client = model_client(args, &args.model_or_default())?;
    let fetcher = HttpFetcher::new(Duration::from_secs(fetch_timeout_secs))?;
    Ok(Runner::new(store, Arc::new(fetcher), client, registry(args))
        .with_concurrency(args.concurrency))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}
