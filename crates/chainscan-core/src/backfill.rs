//! Backfill runner: one-off, idempotent data-transformation scripts with a
//! persisted status, distinct from schema DDL.
//!
//! `execute_pending` runs every registered script that is `not_started`,
//! `failed`, or left `pending` by an interrupted run, oldest timestamp first.
//! The first failure is recorded and stops the run; it is retried next time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::store::ScriptStore;
use crate::types::ScriptMigrationStatus;

/// A registered backfill script.
///
/// `run` must be idempotent and safe to interrupt: the runner gives no
/// rollback of partial effects.
#[async_trait]
pub trait BackfillScript: Send + Sync {
    /// Unique, stable name (`recompute-balances-v2`).
    fn name(&self) -> &str;

    /// Ordering key (unix seconds of authoring).
    fn timestamp(&self) -> i64;

    /// Older scripts this one makes redundant; they are moved to `outdated`.
    fn supersedes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Schema version the script was written against. A script older than
    /// the store's schema is outdated rather than run.
    fn schema_version(&self) -> Option<u32> {
        None
    }

    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn run(&self, params: &serde_json::Value) -> Result<(), IndexerError>;
}

/// What one `execute_pending` call did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub completed: Vec<String>,
    pub outdated: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct BackfillRunner<S: ?Sized> {
    store: Arc<S>,
    scripts: Vec<Arc<dyn BackfillScript>>,
}

impl<S: ScriptStore + ?Sized> BackfillRunner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            scripts: Vec::new(),
        }
    }

    /// Register a script. Registering the same name twice keeps the first.
    pub fn register(&mut self, script: Arc<dyn BackfillScript>) -> &mut Self {
        if self.scripts.iter().any(|s| s.name() == script.name()) {
            tracing::warn!(script = script.name(), "Script already registered");
        } else {
            self.scripts.push(script);
        }
        self
    }

    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|s| s.name())
    }

    pub async fn execute_pending(&self) -> Result<BackfillReport, IndexerError> {
        let mut report = BackfillReport::default();

        for script in &self.scripts {
            self.store
                .register_script(script.name(), script.timestamp(), &script.params())
                .await?;
        }

        self.mark_superseded(&mut report).await?;
        self.mark_schema_outdated(&mut report).await?;

        let mut ordered: Vec<&Arc<dyn BackfillScript>> = self.scripts.iter().collect();
        ordered.sort_by(|a, b| (a.timestamp(), a.name()).cmp(&(b.timestamp(), b.name())));

        for script in ordered {
            let name = script.name();
            let Some(row) = self.store.script(name).await? else {
                continue;
            };
            if !row.status.is_runnable() {
                continue;
            }
            if row.status != ScriptMigrationStatus::Pending
                && !self
                    .store
                    .transition_script(name, row.status, ScriptMigrationStatus::Pending)
                    .await?
            {
                report.skipped.push(name.to_string());
                continue;
            }

            tracing::info!(script = name, "Running backfill script");
            match script.run(&row.params).await {
                Ok(()) => {
                    self.store
                        .transition_script(
                            name,
                            ScriptMigrationStatus::Pending,
                            ScriptMigrationStatus::Completed,
                        )
                        .await?;
                    tracing::info!(script = name, "Backfill script completed");
                    report.completed.push(name.to_string());
                }
                Err(e) => {
                    self.store
                        .transition_script(
                            name,
                            ScriptMigrationStatus::Pending,
                            ScriptMigrationStatus::Failed,
                        )
                        .await?;
                    tracing::error!(script = name, error = %e, "Backfill script failed");
                    return Err(IndexerError::Script {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn mark_superseded(&self, report: &mut BackfillReport) -> Result<(), IndexerError> {
        for script in &self.scripts {
            for old in script.supersedes() {
                self.outdate(&old, report).await?;
            }
        }
        Ok(())
    }

    async fn mark_schema_outdated(&self, report: &mut BackfillReport) -> Result<(), IndexerError> {
        let current = self.store.schema_version().await?;
        for script in &self.scripts {
            if matches!(script.schema_version(), Some(v) if v < current) {
                self.outdate(script.name(), report).await?;
            }
        }
        Ok(())
    }

    async fn outdate(&self, name: &str, report: &mut BackfillReport) -> Result<(), IndexerError> {
        let Some(row) = self.store.script(name).await? else {
            return Ok(());
        };
        if !row.status.can_transition_to(ScriptMigrationStatus::Outdated) {
            if row.status == ScriptMigrationStatus::Pending {
                tracing::warn!(script = name, "Cannot outdate a script that is mid-run");
            }
            return Ok(());
        }
        if self
            .store
            .transition_script(name, row.status, ScriptMigrationStatus::Outdated)
            .await?
        {
            tracing::info!(script = name, was = %row.status, "Script marked outdated");
            report.outdated.push(name.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScriptMigration;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripts {
        rows: Mutex<HashMap<String, ScriptMigration>>,
        version: u32,
    }

    #[async_trait]
    impl ScriptStore for Scripts {
        async fn register_script(
            &self,
            name: &str,
            timestamp: i64,
            params: &serde_json::Value,
        ) -> Result<ScriptMigration, IndexerError> {
            let mut rows = self.rows.lock().unwrap();
            Ok(rows
                .entry(name.to_string())
                .or_insert_with(|| ScriptMigration {
                    name: name.to_string(),
                    timestamp,
                    status: ScriptMigrationStatus::NotStarted,
                    params: params.clone(),
                    updated_at: Utc::now(),
                })
                .clone())
        }
        async fn script(&self, name: &str) -> Result<Option<ScriptMigration>, IndexerError> {
            Ok(self.rows.lock().unwrap().get(name).cloned())
        }
        async fn scripts(&self) -> Result<Vec<ScriptMigration>, IndexerError> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }
        async fn transition_script(
            &self,
            name: &str,
            from: ScriptMigrationStatus,
            to: ScriptMigrationStatus,
        ) -> Result<bool, IndexerError> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(name) {
                Some(row) if row.status == from => {
                    row.status = to;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        async fn schema_version(&self) -> Result<u32, IndexerError> {
            Ok(self.version)
        }
    }

    struct Counting {
        name: &'static str,
        ts: i64,
        runs: AtomicU32,
        fail: bool,
        supersedes: Vec<String>,
        schema: Option<u32>,
    }

    impl Counting {
        fn new(name: &'static str, ts: i64) -> Self {
            Self {
                name,
                ts,
                runs: AtomicU32::new(0),
                fail: false,
                supersedes: vec![],
                schema: None,
            }
        }
    }

    #[async_trait]
    impl BackfillScript for Counting {
        fn name(&self) -> &str {
            self.name
        }
        fn timestamp(&self) -> i64 {
            self.ts
        }
        fn supersedes(&self) -> Vec<String> {
            self.supersedes.clone()
        }
        fn schema_version(&self) -> Option<u32> {
            self.schema
        }
        async fn run(&self, _params: &serde_json::Value) -> Result<(), IndexerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(IndexerError::Other("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn status(store: &Scripts, name: &str) -> ScriptMigrationStatus {
        store.script(name).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn completed_script_runs_once() {
        let store = Arc::new(Scripts::default());
        let script = Arc::new(Counting::new("a", 1));
        let mut runner = BackfillRunner::new(store.clone());
        runner.register(script.clone());

        let first = runner.execute_pending().await.unwrap();
        assert_eq!(first.completed, vec!["a".to_string()]);
        let second = runner.execute_pending().await.unwrap();
        assert!(second.completed.is_empty());
        assert_eq!(script.runs.load(Ordering::SeqCst), 1);
        assert_eq!(status(&store, "a").await, ScriptMigrationStatus::Completed);
    }

    #[tokio::test]
    async fn failure_stops_the_run_and_is_retried() {
        let store = Arc::new(Scripts::default());
        let mut failing = Counting::new("a", 1);
        failing.fail = true;
        let later = Arc::new(Counting::new("b", 2));
        let mut runner = BackfillRunner::new(store.clone());
        runner.register(later.clone()).register(Arc::new(failing));

        let err = runner.execute_pending().await.unwrap_err();
        assert!(matches!(err, IndexerError::Script { ref name, .. } if name == "a"));
        assert_eq!(status(&store, "a").await, ScriptMigrationStatus::Failed);
        assert_eq!(later.runs.load(Ordering::SeqCst), 0);

        assert!(runner.execute_pending().await.is_err());
        assert_eq!(status(&store, "a").await, ScriptMigrationStatus::Failed);
    }

    #[tokio::test]
    async fn superseded_script_is_outdated_not_run() {
        let store = Arc::new(Scripts::default());
        let v1 = Arc::new(Counting::new("fix-v1", 1));
        let mut v2 = Counting::new("fix-v2", 2);
        v2.supersedes = vec!["fix-v1".into()];
        let mut runner = BackfillRunner::new(store.clone());
        runner.register(v1.clone()).register(Arc::new(v2));

        let report = runner.execute_pending().await.unwrap();
        assert_eq!(report.outdated, vec!["fix-v1".to_string()]);
        assert_eq!(report.completed, vec!["fix-v2".to_string()]);
        assert_eq!(v1.runs.load(Ordering::SeqCst), 0);
        assert_eq!(status(&store, "fix-v1").await, ScriptMigrationStatus::Outdated);
    }

    #[tokio::test]
    async fn script_older_than_schema_is_outdated() {
        let store = Arc::new(Scripts {
            version: 3,
            ..Default::default()
        });
        let mut old = Counting::new("old", 1);
        old.schema = Some(2);
        let old = Arc::new(old);
        let mut runner = BackfillRunner::new(store.clone());
        runner.register(old.clone());

        runner.execute_pending().await.unwrap();
        assert_eq!(old.runs.load(Ordering::SeqCst), 0);
        assert_eq!(status(&store, "old").await, ScriptMigrationStatus::Outdated);
    }

    #[tokio::test]
    async fn interrupted_script_is_resumed() {
        let store = Arc::new(Scripts::default());
        let script = Arc::new(Counting::new("a", 1));
        store
            .register_script("a", 1, &serde_json::Value::Null)
            .await
            .unwrap();
        store
            .transition_script("a", ScriptMigrationStatus::NotStarted, ScriptMigrationStatus::Pending)
            .await
            .unwrap();

        let mut runner = BackfillRunner::new(store.clone());
        runner.register(script.clone());
        runner.execute_pending().await.unwrap();
        assert_eq!(script.runs.load(Ordering::SeqCst), 1);
        assert_eq!(status(&store, "a").await, ScriptMigrationStatus::Completed);
    }
}
