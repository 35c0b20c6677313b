use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    identify, Cluster, ContactId, ContactLedger, ContactRecord, IdentifyRequest, IdentityError,
    LinkPrecedence, NewContact, Relink, Resolution,
};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, Params, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  phone_number TEXT,
  email TEXT,
  linked_id INTEGER,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkViolation {
    pub contact_id: ContactId,
    pub linked_id: ContactId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedValue {
    pub field: String,
    pub value: String,
    pub anchors: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub shared_values: Vec<SharedValue>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.link_violations.is_empty()
            && self.shared_values.is_empty()
    }
}

/// Ledger view over one open `BEGIN IMMEDIATE` transaction.
pub struct SqliteLedger<'conn> {
    tx: Transaction<'conn>,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Override how long a statement waits on another connection's lock before failing busy.
    ///
    /// # Errors
    /// Returns an error when the timeout cannot be applied.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout).context("failed to set sqlite busy timeout")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            // Another connection may have migrated while this one waited for the lock.
            if current_schema_version(&tx)? < 1 {
                tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
                record_schema_version(&tx, 1)?;
                tracing::info!(version = 1, "applied schema migration");
            }
            tx.commit().context("failed to commit migration v1")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so no other connection can interleave between the
    /// reads and writes `f` performs. Changes commit only when `f` returns `Ok`.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot start or commit, or when `f` fails.
    pub fn run_atomically<T>(
        &mut self,
        f: impl FnOnce(&mut SqliteLedger<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identify transaction")?;
        let mut ledger = SqliteLedger { tx };
        let value = f(&mut ledger)?;
        ledger.tx.commit().context("failed to commit identify transaction")?;
        Ok(value)
    }

    /// Resolve one request against the store as a single transaction.
    ///
    /// # Errors
    /// Returns an error when the request violates the core precondition, stored clusters are
    /// malformed, or any `SQLite` operation fails. Nothing is written in that case.
    pub fn identify_at(
        &mut self,
        request: &IdentifyRequest,
        now: OffsetDateTime,
    ) -> Result<Resolution> {
        self.run_atomically(|ledger| identify(ledger, request, now))
    }

    /// Load every contact, deleted ones included, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_records(&self) -> Result<Vec<ContactRecord>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts");
        let mut records = query_records(&self.conn, &sql, [])?;
        records.sort_by_key(ContactRecord::age_key);
        Ok(records)
    }

    /// Fetch one contact by id.
    ///
    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_record(&self, id: ContactId) -> Result<Option<ContactRecord>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1");
        Ok(query_records(&self.conn, &sql, params![id.0])?.into_iter().next())
    }

    /// The full live cluster that contact `id` belongs to, or `None` when it is missing or deleted.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the stored cluster is malformed.
    pub fn cluster_of(&self, id: ContactId) -> Result<Option<Cluster>> {
        let Some(record) = self.get_record(id)?.filter(ContactRecord::is_live) else {
            return Ok(None);
        };
        let anchor = record.anchor_id()?;
        let members = load_cluster(&self.conn, anchor)?;
        Ok(Some(Cluster::assemble(anchor, members)?))
    }

    /// Set `deleted_at` on a live contact. The row is kept.
    ///
    /// A PRIMARY that still anchors live secondaries is refused, since deleting it would leave
    /// those secondaries pointing at a dead anchor.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError::StaleRecord`] when `id` is missing or deleted,
    /// or an error naming the dependents when `id` still anchors live secondaries.
    pub fn soft_delete(&mut self, id: ContactId, at: OffsetDateTime) -> Result<()> {
        let stamp = rfc3339(at)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start soft-delete transaction")?;
        let dependents: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM contacts WHERE linked_id = ?1 AND deleted_at IS NULL",
                params![id.0],
                |row| row.get(0),
            )
            .context("failed to count live secondaries")?;
        if dependents > 0 {
            return Err(anyhow!(
                "contact {id} is the primary of {dependents} live secondary contact(s); \
                 delete those first"
            ));
        }
        let changed = tx
            .execute(
                "UPDATE contacts SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![stamp, id.0],
            )
            .context("failed to soft-delete contact")?;
        if changed == 0 {
            return Err(IdentityError::StaleRecord(id).into());
        }
        tx.commit().context("failed to commit soft delete")?;
        Ok(())
    }

    /// Create a `SQLite` backup file for this database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, cluster shape and value overlap probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let (link_violations, shared_values) = if schema_status.current_version == 0 {
            // No contacts table yet; the pending versions say so.
            (Vec::new(), Vec::new())
        } else {
            (self.link_violations()?, self.shared_values()?)
        };
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations,
            shared_values,
            schema_status,
        })
    }

    fn link_violations(&self) -> Result<Vec<LinkViolation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.linked_id,
                    CASE
                      WHEN p.id IS NULL THEN 'linked contact is missing'
                      WHEN p.deleted_at IS NOT NULL THEN 'linked contact is deleted'
                      ELSE 'linked contact is secondary'
                    END
                 FROM contacts c
                 LEFT JOIN contacts p ON p.id = c.linked_id
                 WHERE c.deleted_at IS NULL
                   AND c.link_precedence = 'secondary'
                   AND (p.id IS NULL OR p.deleted_at IS NOT NULL OR p.link_precedence <> 'primary')
                 ORDER BY c.id ASC",
            )
            .context("failed to prepare link violation probe")?;
        let rows = stmt.query_map([], |row| {
            Ok(LinkViolation {
                contact_id: ContactId(row.get(0)?),
                linked_id: ContactId(row.get(1)?),
                reason: row.get(2)?,
            })
        })?;

        let mut violations = Vec::new();
        for row in rows {
            violations.push(row?);
        }
        Ok(violations)
    }

    fn shared_values(&self) -> Result<Vec<SharedValue>> {
        let mut owners: BTreeMap<(&'static str, String), BTreeSet<ContactId>> = BTreeMap::new();
        for record in self.list_records()?.into_iter().filter(ContactRecord::is_live) {
            let anchor = record.linked_id.unwrap_or(record.id);
            if let Some(email) = record.email {
                owners.entry(("email", email)).or_default().insert(anchor);
            }
            if let Some(phone_number) = record.phone_number {
                owners.entry(("phone_number", phone_number)).or_default().insert(anchor);
            }
        }

        Ok(owners
            .into_iter()
            .filter(|(_, anchors)| anchors.len() > 1)
            .map(|((field, value), anchors)| SharedValue {
                field: field.to_string(),
                value,
                anchors: anchors.into_iter().collect(),
            })
            .collect())
    }
}

impl ContactLedger for SqliteLedger<'_> {
    type Error = anyhow::Error;

    fn find_live(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL AND (email = ?1 OR phone_number = ?2)"
        );
        let mut records = query_records(&self.tx, &sql, params![email, phone_number])?;
        records.sort_by_key(ContactRecord::age_key);
        Ok(records)
    }

    fn load_cluster(&self, anchor: ContactId) -> Result<Vec<ContactRecord>> {
        load_cluster(&self.tx, anchor)
    }

    fn create_record(&mut self, contact: NewContact) -> Result<ContactRecord> {
        let stamp = rfc3339(contact.created_at)?;
        self.tx
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, link_precedence, linked_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.link_precedence.as_str(),
                    contact.linked_id.map(|id| id.0),
                    stamp,
                ],
            )
            .context("failed to insert contact")?;
        let id = ContactId(self.tx.last_insert_rowid());
        tracing::debug!(%id, precedence = contact.link_precedence.as_str(), "created contact");
        Ok(contact.into_record(id))
    }

    fn relink(&mut self, id: ContactId, relink: Relink) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE contacts
                 SET link_precedence = ?1, linked_id = ?2, updated_at = ?3
                 WHERE id = ?4 AND deleted_at IS NULL",
                params![
                    relink.link_precedence.as_str(),
                    relink.linked_id.0,
                    rfc3339(relink.updated_at)?,
                    id.0
                ],
            )
            .context("failed to relink contact")?;
        if changed == 0 {
            return Err(IdentityError::StaleRecord(id).into());
        }
        tracing::debug!(%id, linked_id = %relink.linked_id, "relinked contact");
        Ok(())
    }
}

/// Whether `err` is worth retrying from a fresh transaction: lock contention, or a record that
/// changed underneath the resolver.
#[must_use]
pub fn is_transient_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(sqlite) = cause.downcast_ref::<rusqlite::Error>() {
            return matches!(
                sqlite.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            );
        }
        matches!(cause.downcast_ref::<IdentityError>(), Some(IdentityError::StaleRecord(_)))
    })
}

/// The core error carried by `err`, if any.
#[must_use]
pub fn identity_error(err: &anyhow::Error) -> Option<&IdentityError> {
    err.chain().find_map(|cause| cause.downcast_ref::<IdentityError>())
}

fn load_cluster(conn: &Connection, anchor: ContactId) -> Result<Vec<ContactRecord>> {
    let sql = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)"
    );
    let mut records = query_records(conn, &sql, params![anchor.0])?;
    records.sort_by_key(ContactRecord::age_key);
    Ok(records)
}

fn query_records<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<ContactRecord>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare contact query")?;
    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();

    while let Some(row) = rows.next()? {
        let link_precedence_raw: String = row.get(3)?;
        let deleted_at: Option<String> = row.get(7)?;
        records.push(ContactRecord {
            id: ContactId(row.get(0)?),
            email: row.get(1)?,
            phone_number: row.get(2)?,
            link_precedence: LinkPrecedence::parse(&link_precedence_raw)
                .ok_or_else(|| anyhow!("unknown link_precedence: {link_precedence_raw}"))?,
            linked_id: row.get::<_, Option<i64>>(4)?.map(ContactId),
            created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            deleted_at: deleted_at.as_deref().map(parse_rfc3339).transpose()?,
        });
    }

    Ok(records)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
