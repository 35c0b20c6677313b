use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use identity_kernel_core::{
    ContactId, ContactRecord, IdentifyRequest, IdentityError, IdentityView, Resolution,
    ResolutionOutcome,
};
use identity_kernel_store_sqlite::{
    identity_error, is_transient_failure, IntegrityReport, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod validation;

pub use validation::{parse_identify_request, ValidationError};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("stored contact graph is inconsistent: {0}")]
    InvariantBreach(String),
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn classify(err: anyhow::Error, attempts: u32) -> Self {
        if is_transient_failure(&err) {
            return Self::Unavailable { attempts, message: format!("{err:#}") };
        }
        match identity_error(&err) {
            Some(IdentityError::InvariantBreach(message)) => Self::InvariantBreach(message.clone()),
            Some(IdentityError::Precondition(_)) => {
                Self::Validation(ValidationError::MissingIdentifier)
            }
            _ => Self::Internal(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
    max_attempts: u32,
    busy_timeout: Duration,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Cap the number of transactions one `identify` call may run. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// How long one attempt waits on another writer's lock before it counts as failed.
    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path)?;
        store.set_busy_timeout(self.busy_timeout)?;
        Ok(store)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Validate a raw JSON body and resolve it.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for malformed bodies, otherwise see [`Self::identify`].
    pub fn identify_json(&self, body: &serde_json::Value) -> Result<Resolution, ApiError> {
        let request = parse_identify_request(body)?;
        self.identify(&request)
    }

    /// Resolve one request, retrying transient store failures from a fresh transaction.
    ///
    /// # Errors
    /// Returns [`ApiError::Unavailable`] once `max_attempts` transactions failed transiently,
    /// [`ApiError::InvariantBreach`] when stored clusters are malformed, and
    /// [`ApiError::Internal`] for any other store failure.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<Resolution, ApiError> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let result = self
                .open_migrated()
                .and_then(|mut store| store.identify_at(request, OffsetDateTime::now_utc()));

            match result {
                Ok(resolution) => {
                    log_resolution(&resolution, attempt);
                    return Ok(resolution);
                }
                Err(err) if is_transient_failure(&err) && attempt < self.max_attempts => {
                    tracing::warn!(attempt, error = %format!("{err:#}"), "identify retry");
                    thread::sleep(RETRY_BACKOFF * attempt);
                }
                Err(err) => {
                    let err = ApiError::classify(err, attempt);
                    tracing::error!(attempt, error = %err, "identify failed");
                    return Err(err);
                }
            }
        }
    }

    /// Projection of the cluster containing `id`, or `None` when it is missing or deleted.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the cluster is malformed.
    pub fn contact_show(&self, id: ContactId) -> Result<Option<IdentityView>, ApiError> {
        let store = self.open_migrated()?;
        let cluster = store.cluster_of(id).map_err(|err| ApiError::classify(err, 1))?;
        Ok(cluster.as_ref().map(IdentityView::project))
    }

    /// Every stored contact, deleted ones included, oldest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn contact_list(&self) -> Result<Vec<ContactRecord>> {
        self.open_migrated()?.list_records()
    }

    /// Soft-delete one contact.
    ///
    /// # Errors
    /// Returns an error when the contact is missing, already deleted, or the write fails.
    pub fn contact_delete(&self, id: ContactId) -> Result<ContactRecord> {
        let mut store = self.open_migrated()?;
        store.soft_delete(id, OffsetDateTime::now_utc())?;
        store
            .get_record(id)?
            .ok_or_else(|| anyhow::anyhow!("contact {id} vanished after soft delete"))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the store's structural and cluster-shape checks.
    ///
    /// An unmigrated database reports its pending versions instead of cluster probes.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or a probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Migrate, then write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or migrated, or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_migrated()?.backup_database(out_file)
    }
}

fn log_resolution(resolution: &Resolution, attempt: u32) {
    let primary_contact_id = resolution.cluster.anchor_id();
    match &resolution.outcome {
        ResolutionOutcome::Merged { absorbed_primaries, relinked_secondaries, .. } => {
            tracing::info!(
                %primary_contact_id,
                absorbed = absorbed_primaries.len(),
                relinked = relinked_secondaries.len(),
                attempt,
                "merged identity clusters"
            );
        }
        outcome => {
            tracing::info!(%primary_contact_id, ?outcome, attempt, "identify resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::mpsc;
    use std::time::Instant;

    use identity_kernel_core::LinkPrecedence;
    use serde_json::json;
    use ulid::Ulid;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("identity-kernel-api-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn migrate_dry_run_then_apply() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn identify_json_links_then_merges() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let first = api.identify_json(&json!({"email": "lorraine@hillvalley.edu", "phoneNumber": "123456"}))?;
        let linked = api.identify_json(&json!({"email": "mcfly@hillvalley.edu", "phoneNumber": "123456"}))?;
        assert_eq!(linked.view().primary_contact_id, first.cluster.anchor_id());
        assert_eq!(linked.view().emails, vec!["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]);

        let other = api.identify_json(&json!({"email": "george@hillvalley.edu", "phoneNumber": "919191"}))?;
        let merged = api.identify_json(&json!({"email": "george@hillvalley.edu", "phoneNumber": "123456"}))?;
        let view = merged.view();
        assert_eq!(view.primary_contact_id, first.cluster.anchor_id());
        assert!(view.secondary_contact_ids.contains(&other.cluster.anchor_id()));
        assert!(matches!(merged.outcome, ResolutionOutcome::Merged { .. }));

        let demoted = api
            .contact_list()?
            .into_iter()
            .find(|record| record.id == other.cluster.anchor_id())
            .map(|record| record.link_precedence);
        assert_eq!(demoted, Some(LinkPrecedence::Secondary));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn invalid_body_is_rejected_before_touching_the_store() {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let result = api.identify_json(&json!({"email": "nope"}));
        assert!(matches!(result, Err(ApiError::Validation(ValidationError::InvalidEmail))));
        assert!(!db_path.exists());
    }

    // Test IDs: TAPI-004
    #[test]
    fn contact_show_projects_whole_cluster_from_any_member() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        api.identify(&IdentifyRequest::new(Some("a@x.com"), Some("1")))?;
        let view = api.identify(&IdentifyRequest::new(Some("b@x.com"), Some("1")))?.view();

        let shown = api.contact_show(view.secondary_contact_ids[0])?;
        assert_eq!(shown, Some(view));
        assert_eq!(api.contact_show(ContactId(999))?, None);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn store_failures_are_classified_by_cause() {
        let stale = anyhow::Error::from(IdentityError::StaleRecord(ContactId(7)))
            .context("failed to relink contact");
        assert!(matches!(ApiError::classify(stale, 3), ApiError::Unavailable { attempts: 3, .. }));

        let breach = anyhow::Error::from(IdentityError::InvariantBreach("chain".to_string()));
        assert!(matches!(ApiError::classify(breach, 1), ApiError::InvariantBreach(message) if message == "chain"));

        let other = anyhow::anyhow!("disk on fire");
        assert!(matches!(ApiError::classify(other, 1), ApiError::Internal(_)));
    }

    // Test IDs: TAPI-006
    #[test]
    fn zero_max_attempts_still_runs_once() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone()).with_max_attempts(0);

        let resolution = api.identify(&IdentifyRequest::new(None, Some("555")))?;
        assert_eq!(resolution.outcome, ResolutionOutcome::CreatedPrimary);

        cleanup(&db_path);
        Ok(())
    }

    /// Hold the write lock on `db_path` from another connection until `release` fires or is
    /// dropped. Returns once the lock is taken.
    fn hold_write_lock(
        db_path: &Path,
        release: mpsc::Receiver<()>,
    ) -> Result<thread::JoinHandle<Result<()>>> {
        let (locked_tx, locked_rx) = mpsc::channel();
        let path = db_path.to_path_buf();
        let handle = thread::spawn(move || -> Result<()> {
            let mut store = SqliteStore::open(&path)?;
            store.run_atomically(|_| {
                let _ = locked_tx.send(());
                let _ = release.recv();
                Ok(())
            })
        });
        locked_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("lock holder exited before taking the lock"))?;
        Ok(handle)
    }

    fn join_holder(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
        handle.join().map_err(|_| anyhow::anyhow!("lock holder panicked"))?
    }

    // Test IDs: TAPI-007
    #[test]
    fn identify_retries_until_lock_is_released() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone())
            .with_max_attempts(10)
            .with_busy_timeout(Duration::from_millis(20));
        api.migrate(false)?;

        let (release_tx, release_rx) = mpsc::channel();
        let holder = hold_write_lock(&db_path, release_rx)?;
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let _ = release_tx.send(());
        });

        let started = Instant::now();
        let resolution = api.identify(&IdentifyRequest::new(Some("a@x.com"), None))?;
        assert_eq!(resolution.outcome, ResolutionOutcome::CreatedPrimary);
        assert!(started.elapsed() >= Duration::from_millis(100));

        releaser.join().map_err(|_| anyhow::anyhow!("releaser panicked"))?;
        join_holder(holder)?;
        assert_eq!(api.contact_list()?.len(), 1);
        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn identify_reports_unavailable_after_exhausting_attempts() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone())
            .with_max_attempts(2)
            .with_busy_timeout(Duration::from_millis(20));
        api.migrate(false)?;

        let (release_tx, release_rx) = mpsc::channel();
        let holder = hold_write_lock(&db_path, release_rx)?;

        let result = api.identify(&IdentifyRequest::new(Some("a@x.com"), None));
        let _ = release_tx.send(());
        join_holder(holder)?;

        assert!(
            matches!(result, Err(ApiError::Unavailable { attempts: 2, .. })),
            "unexpected result: {result:?}"
        );
        assert!(api.contact_list()?.is_empty());
        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn integrity_check_on_fresh_database_reports_pending_migration() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let report = api.integrity_check()?;
        assert_eq!(report.schema_status.pending_versions, vec![1]);
        assert!(report.link_violations.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn contact_delete_refuses_anchor_of_live_cluster() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityApi::new(db_path.clone());

        let primary = api.identify(&IdentifyRequest::new(Some("a@x.com"), None))?;
        let primary = primary.cluster.anchor_id();
        api.identify(&IdentifyRequest::new(Some("a@x.com"), Some("555")))?;

        assert!(api.contact_delete(primary).is_err());
        let view = api.identify(&IdentifyRequest::new(None, Some("555")))?.view();
        assert_eq!(view.primary_contact_id, primary);

        cleanup(&db_path);
        Ok(())
    }
}
