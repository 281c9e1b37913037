use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use claims_router::Action;
use claims_router::RouterEvent;
use claims_router::RouterEventSink;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub candidates_generated: usize,
    pub documents_indexed: usize,
    pub matches_auto_submit: usize,
    pub matches_smart_prompt: usize,
    pub matches_hold: usize,
    pub prompts_created: usize,
    pub sync_jobs_completed: usize,
    pub sync_jobs_failed: usize,
    pub sync_jobs_cancelled: usize,
}

#[derive(Debug)]
struct TelemetryStore {
    path: PathBuf,
}

impl TelemetryStore {
    fn from_env() -> Option<Self> {
        let home = env::var_os("CLAIMS_HOME")?;
        let mut path = PathBuf::from(home);
        path.push("telemetry.json");
        Some(Self { path })
    }

    fn read(&self) -> Result<Option<TelemetryCounters>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|err| format!("read {}: {err}", self.path.display()))?;
        let counters = serde_json::from_slice(&data)
            .map_err(|err| format!("parse {}: {err}", self.path.display()))?;
        Ok(Some(counters))
    }

    fn persist(&self, counters: &TelemetryCounters) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| format!("create {}: {err}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(counters).map_err(|err| err.to_string())?;
        fs::write(&self.path, data).map_err(|err| format!("write {}: {err}", self.path.display()))
    }
}

#[derive(Debug, Default)]
struct TelemetryInner {
    counters: TelemetryCounters,
    store: Option<TelemetryStore>,
}

impl TelemetryInner {
    fn with_store(store: Option<TelemetryStore>) -> Self {
        match store {
            Some(store) => {
                let counters = match store.read() {
                    Ok(Some(existing)) => existing,
                    Ok(None) => TelemetryCounters::default(),
                    Err(err) => {
                        warn!(path = %store.path.display(), error = %err, "failed to load persisted telemetry; continuing with defaults");
                        TelemetryCounters::default()
                    }
                };
                Self {
                    counters,
                    store: Some(store),
                }
            }
            None => Self::default(),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(err) = store.persist(&self.counters)
        {
            warn!(path = %store.path.display(), error = %err, "failed to persist telemetry counters");
        }
    }
}

/// Process-wide pipeline counters with optional `CLAIMS_HOME/telemetry.json`
/// persistence, so a restarted CLI invocation keeps its running totals.
#[derive(Clone, Default)]
pub struct ClaimsTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl ClaimsTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::from_store(None)
    }

    #[must_use]
    pub fn persistent_from_env() -> Self {
        Self::from_store(TelemetryStore::from_env())
    }

    #[must_use]
    pub fn with_store_path(path: PathBuf) -> Self {
        Self::from_store(Some(TelemetryStore { path }))
    }

    fn from_store(store: Option<TelemetryStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TelemetryInner::with_store(store))),
        }
    }

    fn update<F>(&self, mut updater: F)
    where
        F: FnMut(&mut TelemetryCounters),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner.counters);
            inner.persist();
        }
    }

    pub fn record_candidates(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.update(|counters| counters.candidates_generated += count);
    }

    pub fn record_documents_indexed(&self, count: usize) {
        self.update(|counters| counters.documents_indexed = count);
    }

    pub fn record_prompt_created(&self) {
        self.update(|counters| counters.prompts_created += 1);
    }

    pub fn record_sync_completed(&self) {
        self.update(|counters| counters.sync_jobs_completed += 1);
    }

    pub fn record_sync_failed(&self) {
        self.update(|counters| counters.sync_jobs_failed += 1);
    }

    pub fn record_sync_cancelled(&self) {
        self.update(|counters| counters.sync_jobs_cancelled += 1);
    }

    fn record_action(&self, action: Action) {
        self.update(|counters| match action {
            Action::AutoSubmit => counters.matches_auto_submit += 1,
            Action::SmartPrompt => counters.matches_smart_prompt += 1,
            Action::Hold => counters.matches_hold += 1,
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetryCounters {
        self.inner.lock().map(|inner| inner.counters.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn router_sink(&self) -> TelemetryRouterEventSink {
        TelemetryRouterEventSink {
            telemetry: self.clone(),
        }
    }
}

/// Feeds `ConfidenceRouter` routing decisions into the shared telemetry
/// counters, kept separate from `ConfidenceRouter`'s own decision state the
/// same way a policy evaluation event sink never touches policy state.
#[derive(Clone)]
pub struct TelemetryRouterEventSink {
    telemetry: ClaimsTelemetry,
}

impl RouterEventSink for TelemetryRouterEventSink {
    fn record(&self, event: &RouterEvent) {
        self.telemetry.record_action(event.action);
    }
}
