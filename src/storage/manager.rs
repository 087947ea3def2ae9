//! Session directory lifecycle and encoder selection.
//!
//! One directory per session under the base directory. On create the encoder
//! is chosen by format name; on open it is detected from the event-data file
//! that exists. The manager tracks live writers so a session cannot be
//! deleted out from under one.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::storage::framed::{FramedStore, FRAMED_FILE_NAME};
use crate::storage::jsonl::{JsonlStore, JSONL_FILE_NAME};
use crate::storage::{save_session_metadata, EventStore, Session, StoreError};

/// Encoders the manager knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// Length-prefixed framed protobuf (`events.pb`). The default; pick this
    /// when write throughput or size matters.
    Framed,
    /// Newline-delimited JSON (`events.jsonl`). Pick this when you want to
    /// read the data with your eyes.
    Jsonl,
}

impl StorageFormat {
    /// Parse a user-supplied format name.
    pub fn parse(name: &str) -> Result<StorageFormat, StoreError> {
        match name.to_ascii_lowercase().as_str() {
            "binary" | "framed" | "protobuf" | "pb" | "proto" => Ok(StorageFormat::Framed),
            "jsonl" | "json" | "lines" => Ok(StorageFormat::Jsonl),
            other => Err(StoreError::InvalidFormat(other.to_string())),
        }
    }
}

pub struct SessionManager {
    base_dir: PathBuf,
    /// Session ids with a live writer; guards delete().
    active: Mutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<SessionManager, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(SessionManager {
            base_dir,
            active: Mutex::new(HashSet::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Enumerate sessions with loadable metadata. Unreadable entries are
    /// skipped; they may be stale or mid-creation.
    pub fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match crate::storage::load_session_metadata(&entry.path()) {
                Ok(session) => sessions.push(session),
                Err(_) => continue,
            }
        }
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(sessions)
    }

    pub fn get(&self, id: &str) -> Result<Session, StoreError> {
        let dir = self.session_dir(id);
        crate::storage::load_session_metadata(&dir).map_err(|err| match err {
            StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                StoreError::NotFound(id.to_string())
            }
            other => other,
        })
    }

    /// Create a session directory, persist its metadata, and construct the
    /// requested encoder with this manager holding the writer mark.
    pub fn create(
        &self,
        session: &Session,
        format: StorageFormat,
    ) -> Result<Arc<dyn EventStore>, StoreError> {
        let dir = self.session_dir(&session.id);
        if dir.exists() {
            return Err(StoreError::AlreadyExists(session.id.clone()));
        }
        fs::create_dir_all(&dir)?;
        save_session_metadata(&dir, session)?;

        let store: Arc<dyn EventStore> = match format {
            StorageFormat::Framed => Arc::new(FramedStore::create(&dir, session)?),
            StorageFormat::Jsonl => Arc::new(JsonlStore::create(&dir, session)?),
        };

        self.active.lock().unwrap().insert(session.id.clone());
        Ok(store)
    }

    /// Open a session for reading, detecting the encoder from the event-data
    /// file present in the directory.
    pub fn open(&self, id: &str) -> Result<Arc<dyn EventStore>, StoreError> {
        let dir = self.session_dir(id);
        if dir.join(FRAMED_FILE_NAME).exists() {
            return Ok(Arc::new(FramedStore::open(&dir)?));
        }
        if dir.join(JSONL_FILE_NAME).exists() {
            return Ok(Arc::new(JsonlStore::open(&dir)?));
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Remove a session directory recursively. Refused while a writer holds
    /// the session.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.active.lock().unwrap().contains(id) {
            return Err(StoreError::InUse(id.to_string()));
        }
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Drop the live-writer mark after the store is closed.
    pub fn release(&self, id: &str) {
        self.active.lock().unwrap().remove(id);
    }
}
