use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;

use super::{
    CONFIG_FILE_NAME, MAX_NAME_ATTEMPTS, OutputKind, SESSION_PREFIX, Session, SessionConfig,
    SessionStore, merge_config, minute_stamp, normalize_session_id, second_stamp, session_id_for,
    url_label, vendor_from_id,
};
use crate::error::PipelineError;

/// One directory per session under `base_dir`.
#[derive(Debug)]
pub struct LocalFsSessionStore {
    base_dir: PathBuf,
    config_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalFsSessionStore {
    /// Open the store, creating `base_dir` if needed.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|err| PipelineError::store_write(&base_dir, err))?;
        Ok(Self {
            base_dir,
            config_locks: Mutex::new(HashMap::new()),
        })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    fn config_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CONFIG_FILE_NAME)
    }

    fn config_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .config_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(session_id.to_owned()).or_default())
    }

    async fn read_config(&self, session_id: &str) -> Result<SessionConfig, PipelineError> {
        let path = self.config_path(session_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(SessionConfig::new()),
            Err(err) => return Err(PipelineError::store_read(path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            PipelineError::store_read(path, std::io::Error::new(ErrorKind::InvalidData, err))
        })
    }

    fn session(&self, session_id: &str, config: SessionConfig) -> Session {
        Session {
            id: session_id.to_owned(),
            path: self.session_dir(session_id),
            vendor: vendor_from_id(session_id),
            config,
        }
    }
}

#[async_trait]
impl SessionStore for LocalFsSessionStore {
    async fn create(
        &self,
        vendor: &str,
        initial_config: SessionConfig,
    ) -> Result<Session, PipelineError> {
        let minute = minute_stamp();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let session_id = session_id_for(vendor, &minute, attempt);
            let dir = self.session_dir(&session_id);
            match fs::create_dir(&dir).await {
                Ok(()) => {
                    write_json_atomic(&self.config_path(&session_id), &initial_config).await?;
                    tracing::info!(session_id = %session_id, path = %dir.display(), "created session");
                    return Ok(self.session(&session_id, initial_config));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(PipelineError::store_write(dir, err)),
            }
        }
        Err(PipelineError::store_write(
            &self.base_dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free session id"),
        ))
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, PipelineError> {
        let session_id = normalize_session_id(session_id);
        match fs::metadata(self.session_dir(&session_id)).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PipelineError::store_read(self.session_dir(&session_id), err)),
        }
        let config = self.read_config(&session_id).await?;
        Ok(Some(self.session(&session_id, config)))
    }

    async fn update_config(
        &self,
        session_id: &str,
        partial: SessionConfig,
    ) -> Result<Session, PipelineError> {
        let session_id = normalize_session_id(session_id);
        let lock = self.config_lock(&session_id);
        let _guard = lock.lock().await;

        if fs::metadata(self.session_dir(&session_id)).await.is_err() {
            return Err(PipelineError::SessionNotFound(session_id));
        }
        let mut config = self.read_config(&session_id).await?;
        merge_config(&mut config, partial);
        write_json_atomic(&self.config_path(&session_id), &config).await?;
        tracing::debug!(session_id = %session_id, keys = config.len(), "updated session config");
        Ok(self.session(&session_id, config))
    }

    async fn save(
        &self,
        session: &Session,
        kind: OutputKind,
        url: &str,
        contents: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        let timestamp = second_stamp();
        let label = url_label(url);
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let path = session.path.join(kind.file_name(&timestamp, &label, attempt));
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(PipelineError::store_write(path, err)),
            };
            file.write_all(contents)
                .await
                .map_err(|err| PipelineError::store_write(&path, err))?;
            file.flush()
                .await
                .map_err(|err| PipelineError::store_write(&path, err))?;
            tracing::debug!(url, path = %path.display(), bytes = contents.len(), "saved output");
            return Ok(path);
        }
        Err(PipelineError::store_write(
            &session.path,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free output file name"),
        ))
    }

    async fn read_raw(&self, path: &Path) -> String {
        match fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read raw content");
                String::new()
            }
        }
    }

    async fn read_json(&self, path: &Path) -> Result<Value, PipelineError> {
        let bytes = fs::read(path)
            .await
            .map_err(|err| PipelineError::store_read(path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| {
            PipelineError::store_read(path, std::io::Error::new(ErrorKind::InvalidData, err))
        })
    }

    async fn list_sessions(&self) -> Result<Vec<String>, PipelineError> {
        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(|err| PipelineError::store_read(&self.base_dir, err))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| PipelineError::store_read(&self.base_dir, err))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir && name.starts_with(SESSION_PREFIX) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn list_files(&self, session: &Session) -> Result<Vec<String>, PipelineError> {
        let mut entries = fs::read_dir(&session.path)
            .await
            .map_err(|err| PipelineError::store_read(&session.path, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| PipelineError::store_read(&session.path, err))?
        {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if let (true, Ok(name)) = (is_file, entry.file_name().into_string()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn write_json_atomic(path: &Path, value: &SessionConfig) -> Result<(), PipelineError> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| PipelineError::store_write(path, std::io::Error::other(err)))?;
    fs::write(&tmp_path, &data)
        .await
        .map_err(|err| PipelineError::store_write(&tmp_path, err))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|err| PipelineError::store_write(path, err))?;
    Ok(())
}
