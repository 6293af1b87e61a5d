//! Session persistence: a config file plus raw/extraction/pagination outputs
//! per session directory.

mod fs;
mod memory;

pub use fs::LocalFsSessionStore;
pub use memory::MemorySessionStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::schema::{ListingsContainer, PageUrlsContainer, Record};

pub const DEFAULT_STORE_DIR: &str = "output/web_crawler";
pub const CONFIG_FILE_NAME: &str = "scrape_config.json";
pub const SESSION_PREFIX: &str = "session_";

/// Upper bound on `_<n>` suffixes tried before giving up on a free name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

pub type SessionConfig = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub path: PathBuf,
    pub vendor: String,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Raw,
    Extraction,
    Pagination,
}

impl OutputKind {
    fn stem(self) -> &'static str {
        match self {
            Self::Raw => "raw_data",
            Self::Extraction => "formatted_data",
            Self::Pagination => "pagination",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Raw => "md",
            Self::Extraction | Self::Pagination => "json",
        }
    }

    /// `<timestamp>_<label>_<stem>[_<n>].<ext>`; `attempt` 1 has no suffix.
    pub fn file_name(self, timestamp: &str, label: &str, attempt: u32) -> String {
        let (stem, ext) = (self.stem(), self.extension());
        if attempt <= 1 {
            format!("{timestamp}_{label}_{stem}.{ext}")
        } else {
            format!("{timestamp}_{label}_{stem}_{attempt}.{ext}")
        }
    }

    pub fn matches(self, file_name: &str) -> bool {
        let Some(stem) = file_name.strip_suffix(&format!(".{}", self.extension())) else {
            return false;
        };
        let stem = match stem.rsplit_once('_') {
            Some((head, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => head,
            _ => stem,
        };
        stem.ends_with(&format!("_{}", self.stem()))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session directory with `initial_config` as its config.
    async fn create(&self, vendor: &str, initial_config: SessionConfig)
    -> Result<Session, PipelineError>;

    async fn load(&self, session_id: &str) -> Result<Option<Session>, PipelineError>;

    /// Shallow-merge `partial` into the stored config.
    async fn update_config(
        &self,
        session_id: &str,
        partial: SessionConfig,
    ) -> Result<Session, PipelineError>;

    /// Write `contents` under a fresh output name; never overwrites.
    async fn save(
        &self,
        session: &Session,
        kind: OutputKind,
        url: &str,
        contents: &[u8],
    ) -> Result<PathBuf, PipelineError>;

    /// Raw page text, or an empty string when the file cannot be read.
    async fn read_raw(&self, path: &Path) -> String;

    async fn read_json(&self, path: &Path) -> Result<Value, PipelineError>;

    async fn list_sessions(&self) -> Result<Vec<String>, PipelineError>;

    async fn list_files(&self, session: &Session) -> Result<Vec<String>, PipelineError>;

    async fn save_raw(&self, session: &Session, url: &str, raw: &str) -> Result<PathBuf, PipelineError> {
        self.save(session, OutputKind::Raw, url, raw.as_bytes()).await
    }

    async fn save_extraction(
        &self,
        session: &Session,
        url: &str,
        records: &[Record],
    ) -> Result<PathBuf, PipelineError> {
        let data = to_pretty_json(session, &ListingsContainer { listings: records })?;
        self.save(session, OutputKind::Extraction, url, &data).await
    }

    async fn save_pagination(
        &self,
        session: &Session,
        url: &str,
        page_urls: &[String],
    ) -> Result<PathBuf, PipelineError> {
        let data = to_pretty_json(session, &PageUrlsContainer { page_urls })?;
        self.save(session, OutputKind::Pagination, url, &data).await
    }
}

fn to_pretty_json<T: Serialize>(session: &Session, value: &T) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec_pretty(value)
        .map_err(|err| PipelineError::store_write(&session.path, std::io::Error::other(err)))
}

/// Replace anything that is not alphanumeric, `-` or `.` with `-`.
///
/// Labels end up between `_` separators in ids and file names, so they must
/// not contain `_` themselves.
pub fn sanitize_label(raw: &str) -> String {
    let label = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "unknown".to_owned()
    } else {
        label.to_owned()
    }
}

/// The path segment following `brands`, or `unknown`.
pub fn url_label(url: &str) -> String {
    let mut segments = url.split('/');
    while let Some(segment) = segments.next() {
        if segment == "brands" {
            if let Some(next) = segments.next() {
                let next = next.split(['?', '#']).next().unwrap_or_default();
                return sanitize_label(next);
            }
        }
    }
    "unknown".to_owned()
}

pub fn session_id_for(vendor: &str, minute: &str, attempt: u32) -> String {
    let vendor = sanitize_label(vendor);
    if attempt <= 1 {
        format!("{SESSION_PREFIX}{vendor}_{minute}")
    } else {
        format!("{SESSION_PREFIX}{vendor}_{minute}_{attempt}")
    }
}

pub fn normalize_session_id(session_id: &str) -> String {
    if session_id.starts_with(SESSION_PREFIX) {
        session_id.to_owned()
    } else {
        format!("{SESSION_PREFIX}{session_id}")
    }
}

pub fn vendor_from_id(session_id: &str) -> String {
    session_id
        .split('_')
        .nth(1)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_owned()
}

pub fn merge_config(config: &mut SessionConfig, partial: SessionConfig) {
    for (key, value) in partial {
        config.insert(key, value);
    }
}

fn minute_stamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M").to_string()
}

fn second_stamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}
