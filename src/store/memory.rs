use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    CONFIG_FILE_NAME, MAX_NAME_ATTEMPTS, OutputKind, Session, SessionConfig, SessionStore,
    merge_config, minute_stamp, normalize_session_id, second_stamp, session_id_for, url_label,
    vendor_from_id,
};
use crate::error::PipelineError;

#[derive(Debug, Default)]
struct State {
    configs: BTreeMap<String, SessionConfig>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

/// In-process store with the same naming rules as the filesystem store.
#[derive(Debug)]
pub struct MemorySessionStore {
    root: PathBuf,
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("memory"),
            state: Mutex::new(State::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent output write fail with a `StoreWrite` error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn session(&self, session_id: &str, config: SessionConfig) -> Session {
        Session {
            id: session_id.to_owned(),
            path: self.root.join(session_id),
            vendor: vendor_from_id(session_id),
            config,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        vendor: &str,
        initial_config: SessionConfig,
    ) -> Result<Session, PipelineError> {
        let minute = minute_stamp();
        let mut state = self.state.lock().await;
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let session_id = session_id_for(vendor, &minute, attempt);
            if state.configs.contains_key(&session_id) {
                continue;
            }
            state.configs.insert(session_id.clone(), initial_config.clone());
            return Ok(self.session(&session_id, initial_config));
        }
        Err(PipelineError::store_write(
            &self.root,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free session id"),
        ))
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, PipelineError> {
        let session_id = normalize_session_id(session_id);
        let state = self.state.lock().await;
        Ok(state
            .configs
            .get(&session_id)
            .map(|config| self.session(&session_id, config.clone())))
    }

    async fn update_config(
        &self,
        session_id: &str,
        partial: SessionConfig,
    ) -> Result<Session, PipelineError> {
        let session_id = normalize_session_id(session_id);
        let mut state = self.state.lock().await;
        let Some(config) = state.configs.get_mut(&session_id) else {
            return Err(PipelineError::SessionNotFound(session_id));
        };
        merge_config(config, partial);
        let config = config.clone();
        Ok(self.session(&session_id, config))
    }

    async fn save(
        &self,
        session: &Session,
        kind: OutputKind,
        url: &str,
        contents: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PipelineError::store_write(
                &session.path,
                std::io::Error::new(ErrorKind::PermissionDenied, "writes disabled"),
            ));
        }
        let timestamp = second_stamp();
        let label = url_label(url);
        let mut state = self.state.lock().await;
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let path = session.path.join(kind.file_name(&timestamp, &label, attempt));
            if state.files.contains_key(&path) {
                continue;
            }
            state.files.insert(path.clone(), contents.to_vec());
            return Ok(path);
        }
        Err(PipelineError::store_write(
            &session.path,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free output file name"),
        ))
    }

    async fn read_raw(&self, path: &Path) -> String {
        let state = self.state.lock().await;
        match state.files.get(path) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => {
                tracing::warn!(path = %path.display(), "failed to read raw content");
                String::new()
            }
        }
    }

    async fn read_json(&self, path: &Path) -> Result<Value, PipelineError> {
        let state = self.state.lock().await;
        let bytes = state
            .files
            .get(path)
            .ok_or_else(|| PipelineError::store_read(path, ErrorKind::NotFound.into()))?;
        serde_json::from_slice(bytes).map_err(|err| {
            PipelineError::store_read(path, std::io::Error::new(ErrorKind::InvalidData, err))
        })
    }

    async fn list_sessions(&self) -> Result<Vec<String>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.configs.keys().cloned().collect())
    }

    async fn list_files(&self, session: &Session) -> Result<Vec<String>, PipelineError> {
        let state = self.state.lock().await;
        if !state.configs.contains_key(&session.id) {
            return Err(PipelineError::SessionNotFound(session.id.clone()));
        }
        let mut names = state
            .files
            .keys()
            .filter(|path| path.parent() == Some(session.path.as_path()))
            .filter_map(|path| path.file_name()?.to_str().map(str::to_owned))
            .collect::<Vec<_>>();
        names.push(CONFIG_FILE_NAME.to_owned());
        names.sort();
        Ok(names)
    }
}
