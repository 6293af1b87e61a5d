use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::model::DEFAULT_MODEL;
use crate::openai::DEFAULT_BASE_URL;
use crate::store::DEFAULT_STORE_DIR;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create and inspect scraping sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Fetch URLs into a session as raw content.
    Fetch(FetchArgs),
    /// Extract records from already-fetched raw content.
    Extract(ExtractArgs),
    /// Discover pagination links in already-fetched raw content.
    Paginate(PaginateArgs),
    /// Fetch, extract and paginate in one go, then record a run summary.
    Run(RunArgs),
    /// Extract a range of previously discovered page URLs.
    ScrapePages(ScrapePagesArgs),
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    New(SessionNewArgs),
    List(StoreArgs),
    Show(SessionArgs),
    Files(SessionArgs),
    /// Merge a JSON object into the session config.
    Set(SessionSetArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelEngine {
    Openai,
    /// Empty model answers at zero cost; heuristics still run.
    Noop,
}

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Session store root (default: $PAGESIFT_STORE_DIR, then `output/web_crawler`).
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

impl StoreArgs {
    pub fn resolve(&self) -> PathBuf {
        if let Some(dir) = &self.store_dir {
            return dir.clone();
        }
        match std::env::var_os("PAGESIFT_STORE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(DEFAULT_STORE_DIR),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Model id (default: the session's stored model, then `gpt-4o-mini`).
    #[arg(long)]
    pub model: Option<String>,

    /// Model backend used when heuristics find nothing.
    #[arg(long, value_enum, default_value_t = ModelEngine::Openai)]
    pub engine: ModelEngine,

    /// OpenAI API base URL.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    /// Per-request timeout for model calls.
    #[arg(long, default_value_t = 60)]
    pub openai_timeout_secs: u64,

    /// Override the input price (USD per 1M tokens).
    #[arg(long)]
    pub input_price_per_mtok: Option<f64>,

    /// Override the output price (USD per 1M tokens).
    #[arg(long)]
    pub output_price_per_mtok: Option<f64>,

    /// Maximum URLs processed at once.
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,

    /// Extra host to run the listing-card heuristics on (repeatable).
    #[arg(long = "heuristic-domain")]
    pub heuristic_domains: Vec<String>,
}

impl ModelArgs {
    pub fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_owned())
    }
}

#[derive(Debug, Args)]
pub struct SessionNewArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Vendor label (default: label of the first URL).
    #[arg(long)]
    pub vendor: Option<String>,

    /// Listing URL to scrape (repeatable).
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// Field to extract per listing (repeatable).
    #[arg(long = "field")]
    pub fields: Vec<String>,

    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Also discover pagination links.
    #[arg(long)]
    pub paginate: bool,

    /// Free-text hints for pagination discovery.
    #[arg(long, default_value = "")]
    pub pagination_details: String,
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Session id, with or without the `session_` prefix.
    #[arg(long)]
    pub session: String,
}

#[derive(Debug, Args)]
pub struct SessionSetArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub session: String,

    /// JSON object whose keys overwrite the stored config.
    #[arg(long)]
    pub json: String,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub session: String,

    /// URL to fetch (repeatable).
    #[arg(long = "url", required = true)]
    pub urls: Vec<String>,

    /// Per-request timeout for page fetches.
    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub session: String,

    /// Page URL (repeatable; paired in order with --raw).
    #[arg(long = "url", required = true)]
    pub urls: Vec<String>,

    /// Raw content file for the matching --url.
    #[arg(long = "raw", required = true)]
    pub raw_paths: Vec<PathBuf>,

    /// Field to extract per listing (repeatable).
    #[arg(long = "field", required = true)]
    pub fields: Vec<String>,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Args)]
pub struct PaginateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub session: String,

    /// Page URL (repeatable; paired in order with --raw).
    #[arg(long = "url", required = true)]
    pub urls: Vec<String>,

    /// Raw content file for the matching --url.
    #[arg(long = "raw", required = true)]
    pub raw_paths: Vec<PathBuf>,

    /// Free-text hints for pagination discovery.
    #[arg(long, default_value = "")]
    pub indications: String,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Existing session; without --url its stored plan is replayed.
    #[arg(long)]
    pub session: Option<String>,

    /// Vendor label for a new session (default: label of the first URL).
    #[arg(long)]
    pub vendor: Option<String>,

    /// Listing URL to scrape (repeatable).
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// Field to extract per listing (repeatable).
    #[arg(long = "field")]
    pub fields: Vec<String>,

    /// Also discover pagination links.
    #[arg(long)]
    pub paginate: bool,

    /// Free-text hints for pagination discovery.
    #[arg(long, default_value = "")]
    pub pagination_details: String,

    /// Per-request timeout for page fetches.
    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Debug, Args)]
pub struct ScrapePagesArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub session: String,

    /// First page index (0-based).
    #[arg(long, default_value_t = 0)]
    pub start: usize,

    /// Last page index, inclusive.
    #[arg(long)]
    pub end: usize,

    /// Field to extract (default: the session's stored fields).
    #[arg(long = "field")]
    pub fields: Vec<String>,

    /// Per-request timeout for page fetches.
    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[command(flatten)]
    pub model: ModelArgs,
}
