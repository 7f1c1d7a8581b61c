//! The compute session every data operation runs inside.
//!
//! A session owns the rayon pool used for CPU-bound work (CSV decoding, null
//! filtering, Parquet encoding) and a registry of object stores keyed by
//! `scheme://bucket`. Sessions are registered by application name, so
//! `get_or_create` hands back the live session when one already exists.
//! Wrap a session in a [`SessionGuard`] to have it stopped on every exit path.

pub mod location;
pub mod store;

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use location::Location;

static ACTIVE: Lazy<Mutex<HashMap<String, Weak<Inner>>>> = Lazy::new(Default::default);

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    app_name: String,
    id: Uuid,
    started_at: DateTime<Utc>,
    pool: rayon::ThreadPool,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
    stopped: AtomicBool,
}

#[derive(Debug, Default)]
pub struct SessionBuilder {
    app_name: Option<String>,
    parallelism: Option<usize>,
}

impl SessionBuilder {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Worker threads for CPU-bound stages. Defaults to the number of cores.
    pub fn parallelism(mut self, threads: Option<usize>) -> Self {
        self.parallelism = threads;
        self
    }

    /// Return the live session registered under this app name, or start one.
    pub fn get_or_create(self) -> Result<Session> {
        let app_name = self
            .app_name
            .unwrap_or_else(|| crate::config::DEFAULT_APP_NAME.to_string());

        let mut active = ACTIVE
            .lock()
            .map_err(|_| anyhow!("session registry poisoned"))?;

        if let Some(inner) = active.get(&app_name).and_then(Weak::upgrade) {
            if !inner.stopped.load(Ordering::Acquire) {
                if self.parallelism.is_some() {
                    warn!(app = %app_name, "reusing live session, requested parallelism ignored");
                }
                debug!(app = %app_name, id = %inner.id, "reusing session");
                return Ok(Session { inner });
            }
        }

        let threads = self
            .parallelism
            .filter(|n| *n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
        let thread_prefix = app_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-worker-{}", thread_prefix, i))
            .build()
            .with_context(|| format!("building worker pool for session {}", app_name))?;

        let inner = Arc::new(Inner {
            app_name: app_name.clone(),
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            pool,
            stores: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });
        active.insert(app_name.clone(), Arc::downgrade(&inner));

        info!(app = %app_name, id = %inner.id, threads, "session started");
        Ok(Session { inner })
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn ensure_live(&self) -> Result<(), JobError> {
        if self.is_stopped() {
            return Err(JobError::SessionStopped {
                app_name: self.inner.app_name.clone(),
            });
        }
        Ok(())
    }

    /// Object store for `location`, built on first use and cached per root.
    pub fn store_for(&self, location: &Location) -> Result<Arc<dyn ObjectStore>> {
        self.ensure_live()?;
        let root = location.root();

        if let Some(store) = self
            .inner
            .stores
            .read()
            .map_err(|_| anyhow!("store registry poisoned"))?
            .get(&root)
        {
            return Ok(Arc::clone(store));
        }

        let mut stores = self
            .inner
            .stores
            .write()
            .map_err(|_| anyhow!("store registry poisoned"))?;
        if let Some(store) = stores.get(&root) {
            return Ok(Arc::clone(store));
        }
        let store = store::build_store(location)?;
        stores.insert(root, Arc::clone(&store));
        Ok(store)
    }

    /// Use `store` for every location under `root` (e.g. `memory://` or
    /// `gs://bucket`), replacing whatever was registered before.
    pub fn register_store(&self, root: impl Into<String>, store: Arc<dyn ObjectStore>) -> Result<()> {
        self.ensure_live()?;
        let root = root.into();
        debug!(app = %self.inner.app_name, %root, "registering object store");
        self.inner
            .stores
            .write()
            .map_err(|_| anyhow!("store registry poisoned"))?
            .insert(root, store);
        Ok(())
    }

    /// Run CPU-bound work on the session's pool without blocking the async
    /// runtime.
    pub async fn run_cpu<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_live()?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.pool.install(f))
            .await
            .context("worker task failed")
    }

    /// Release the session. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(mut active) = ACTIVE.lock() {
            let registered_here = active
                .get(&self.inner.app_name)
                .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(&self.inner));
            if registered_here {
                active.remove(&self.inner.app_name);
            }
        }

        if let Ok(mut stores) = self.inner.stores.write() {
            stores.clear();
        }

        let uptime = Utc::now() - self.inner.started_at;
        info!(
            app = %self.inner.app_name,
            id = %self.inner.id,
            uptime_ms = uptime.num_milliseconds(),
            "session stopped"
        );
    }
}

/// Stops the wrapped session when dropped.
pub struct SessionGuard(Session);

impl SessionGuard {
    pub fn new(session: Session) -> Self {
        Self(session)
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}
