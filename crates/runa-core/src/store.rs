//! Session persistence.
//!
//! Stores hand back owned [`Session`] snapshots; the runtime mutates a
//! snapshot during a turn and saves it at the terminal transition. Saves
//! for the same id are serialized behind a per-id async lock so concurrent
//! writers cannot interleave, and the file store writes atomically via a
//! temp file and rename.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::core::errors::RuntimeError;
use crate::core::errors::RuntimeResult;
use crate::session::Session;

/// Durable storage for sessions.
pub trait SessionStore: Send + Sync {
    /// Loads the session for `session_id`, creating a fresh one when no
    /// record exists.
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, RuntimeResult<Session>>;

    /// Persists a session snapshot, replacing any previous record.
    fn save<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, RuntimeResult<()>>;
}

/// Per-session-id async locks, shared by store implementations.
#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn acquire(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Reclaims the entry once no other writer holds a handle to it.
    ///
    /// Exactly two handles remain when the caller is the last writer: the
    /// map's and the one passed in. `acquire` also runs under the map
    /// mutex, so no new handle can appear between the count check and the
    /// removal.
    fn release(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            map.remove(session_id);
        }
    }
}

fn validate_session_id(session_id: &str) -> RuntimeResult<()> {
    if session_id.is_empty()
        || session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains("..")
    {
        return Err(RuntimeError::persistence(format!(
            "Invalid session id: '{session_id}'"
        )));
    }
    Ok(())
}

/// In-memory store, primarily for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    locks: SessionLocks,
    default_budget: u64,
}

impl MemoryStore {
    pub fn new(default_budget: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            locks: SessionLocks::default(),
            default_budget,
        }
    }
}

impl SessionStore for MemoryStore {
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, RuntimeResult<Session>> {
        async move {
            validate_session_id(session_id)?;
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Ok(sessions
                .get(session_id)
                .cloned()
                .unwrap_or_else(|| Session::new(session_id, self.default_budget)))
        }
        .boxed()
    }

    fn save<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, RuntimeResult<()>> {
        async move {
            validate_session_id(&session.id)?;
            let lock = self.locks.acquire(&session.id);
            {
                let _guard = lock.lock().await;
                self.sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(session.id.clone(), session.clone());
            }
            self.locks.release(&session.id, lock);
            Ok(())
        }
        .boxed()
    }
}

/// File-backed store: one pretty-printed JSON document per session id.
pub struct FileStore {
    root: PathBuf,
    locks: SessionLocks,
    default_budget: u64,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, default_budget: u64) -> Self {
        Self {
            root: root.into(),
            locks: SessionLocks::default(),
            default_budget,
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }
}

impl SessionStore for FileStore {
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, RuntimeResult<Session>> {
        async move {
            validate_session_id(session_id)?;
            let path = self.session_path(session_id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Session::new(session_id, self.default_budget));
                }
                Err(err) => {
                    return Err(RuntimeError::persistence(format!(
                        "Failed to read session file {}",
                        path.display()
                    ))
                    .with_details(err.to_string()));
                }
            };
            serde_json::from_slice(&bytes).map_err(|err| {
                RuntimeError::persistence(format!(
                    "Corrupt session file {}",
                    path.display()
                ))
                .with_details(err.to_string())
            })
        }
        .boxed()
    }

    fn save<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, RuntimeResult<()>> {
        async move {
            validate_session_id(&session.id)?;
            let lock = self.locks.acquire(&session.id);
            let result = self.write_locked(session, &lock).await;
            self.locks.release(&session.id, lock);
            result
        }
        .boxed()
    }
}

impl FileStore {
    async fn write_locked(
        &self,
        session: &Session,
        lock: &tokio::sync::Mutex<()>,
    ) -> RuntimeResult<()> {
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            RuntimeError::persistence(format!(
                "Failed to create session directory {}",
                self.root.display()
            ))
            .with_details(err.to_string())
        })?;

        let json = serde_json::to_vec_pretty(session).map_err(|err| {
            RuntimeError::persistence("Failed to serialize session")
                .with_details(err.to_string())
        })?;

        // Write to a temp file, then rename for atomic replacement.
        let path = self.session_path(&session.id);
        let temp = self.root.join(format!("{}.json.tmp", session.id));
        tokio::fs::write(&temp, &json).await.map_err(|err| {
            RuntimeError::persistence(format!(
                "Failed to write session file {}",
                temp.display()
            ))
            .with_details(err.to_string())
        })?;
        tokio::fs::rename(&temp, &path).await.map_err(|err| {
            RuntimeError::persistence(format!(
                "Failed to replace session file {}",
                path.display()
            ))
            .with_details(err.to_string())
        })?;
        tracing::debug!(session_id = %session.id, path = %path.display(), "saved session");
        Ok(())
    }
}
