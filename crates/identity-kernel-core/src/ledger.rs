//! Record store seam used by [`crate::identify`].
//!
//! Backends supply exact-match lookup, anchor-scoped cluster loads, record creation and
//! re-linking. Atomicity is the backend's job: callers run one `identify` per transaction.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::{ContactId, ContactRecord, IdentityError, NewContact, Relink};

pub trait ContactLedger {
    type Error: From<IdentityError>;

    /// Live records whose email equals `email` or whose phone equals `phone_number`,
    /// ordered by `created_at` then `id`. Absent arguments match nothing.
    ///
    /// # Errors
    /// Returns the backend error when the lookup fails.
    fn find_live(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, Self::Error>;

    /// The anchor record plus every live record whose `linked_id` equals `anchor`.
    ///
    /// # Errors
    /// Returns the backend error when the lookup fails.
    fn load_cluster(&self, anchor: ContactId) -> Result<Vec<ContactRecord>, Self::Error>;

    /// Assign an id to `contact` and persist it.
    ///
    /// # Errors
    /// Returns the backend error when the insert fails.
    fn create_record(&mut self, contact: NewContact) -> Result<ContactRecord, Self::Error>;

    /// Overwrite precedence, `linked_id` and `updated_at` of a live record.
    ///
    /// # Errors
    /// Returns [`IdentityError::StaleRecord`] (converted) when `id` is missing or deleted.
    fn relink(&mut self, id: ContactId, relink: Relink) -> Result<(), Self::Error>;
}

/// In-process ledger backed by an id-keyed arena.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: BTreeMap<ContactId, ContactRecord>,
    last_id: i64,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against this ledger; when it fails every change it made is discarded.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn run_atomically<T, E>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        let snapshot = self.clone();
        let result = f(self);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    /// Insert a record verbatim, keeping its id. Later ids continue after the highest seen.
    pub fn insert(&mut self, record: ContactRecord) {
        self.last_id = self.last_id.max(record.id.0);
        self.records.insert(record.id, record);
    }

    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<&ContactRecord> {
        self.records.get(&id)
    }

    /// Mark a record deleted without removing it.
    ///
    /// # Errors
    /// Returns [`IdentityError::StaleRecord`] when `id` is missing or already deleted, and
    /// [`IdentityError::Precondition`] when it still anchors live secondaries.
    pub fn soft_delete(&mut self, id: ContactId, at: OffsetDateTime) -> Result<(), IdentityError> {
        let dependents = self.collect_live(|record| record.linked_id == Some(id)).len();
        if dependents > 0 {
            return Err(IdentityError::Precondition(format!(
                "contact {id} is the primary of {dependents} live secondary contact(s)"
            )));
        }
        let record = self.live_mut(id)?;
        record.deleted_at = Some(at);
        record.updated_at = at;
        Ok(())
    }

    /// All records, deleted ones included, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<ContactRecord> {
        let mut records = self.records.values().cloned().collect::<Vec<_>>();
        records.sort_by_key(ContactRecord::age_key);
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn live_mut(&mut self, id: ContactId) -> Result<&mut ContactRecord, IdentityError> {
        self.records
            .get_mut(&id)
            .filter(|record| record.is_live())
            .ok_or(IdentityError::StaleRecord(id))
    }

    fn collect_live(&self, keep: impl Fn(&ContactRecord) -> bool) -> Vec<ContactRecord> {
        let mut records = self
            .records
            .values()
            .filter(|record| record.is_live() && keep(record))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(ContactRecord::age_key);
        records
    }
}

impl ContactLedger for MemoryLedger {
    type Error = IdentityError;

    fn find_live(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, Self::Error> {
        Ok(self.collect_live(|record| record.matches(email, phone_number)))
    }

    fn load_cluster(&self, anchor: ContactId) -> Result<Vec<ContactRecord>, Self::Error> {
        Ok(self.collect_live(|record| record.id == anchor || record.linked_id == Some(anchor)))
    }

    fn create_record(&mut self, contact: NewContact) -> Result<ContactRecord, Self::Error> {
        self.last_id += 1;
        let record = contact.into_record(ContactId(self.last_id));
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn relink(&mut self, id: ContactId, relink: Relink) -> Result<(), Self::Error> {
        let record = self.live_mut(id)?;
        record.link_precedence = relink.link_precedence;
        record.linked_id = Some(relink.linked_id);
        record.updated_at = relink.updated_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{at, primary, secondary};
    use crate::{IdentifyRequest, LinkPrecedence};

    // Test IDs: TLED-001
    #[test]
    fn find_live_orders_by_creation_then_id() -> Result<(), IdentityError> {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(3, Some("a"), None, 10));
        ledger.insert(primary(1, None, Some("555"), 20));
        ledger.insert(primary(2, Some("a"), None, 10));
        ledger.insert(primary(4, Some("z"), Some("999"), 0));

        let ids = ledger
            .find_live(Some("a"), Some("555"))?
            .into_iter()
            .map(|record| record.id.0)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3, 1]);
        Ok(())
    }

    // Test IDs: TLED-002
    #[test]
    fn create_record_continues_after_inserted_ids() -> Result<(), IdentityError> {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(41, Some("a"), None, 1));

        let created = ledger.create_record(NewContact::primary(
            &IdentifyRequest::new(Some("b"), None),
            at(2),
        ))?;
        assert_eq!(created.id, ContactId(42));
        assert_eq!(created.updated_at, created.created_at);
        Ok(())
    }

    // Test IDs: TLED-003
    #[test]
    fn relink_rejects_deleted_records() -> Result<(), IdentityError> {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(1, Some("a"), None, 1));
        ledger.insert(primary(2, Some("b"), None, 2));
        ledger.soft_delete(ContactId(2), at(3))?;

        let result = ledger.relink(ContactId(2), Relink::onto(ContactId(1), at(4)));
        assert_eq!(result, Err(IdentityError::StaleRecord(ContactId(2))));
        assert_eq!(
            ledger.relink(ContactId(9), Relink::onto(ContactId(1), at(4))),
            Err(IdentityError::StaleRecord(ContactId(9)))
        );
        Ok(())
    }

    // Test IDs: TLED-004
    #[test]
    fn load_cluster_excludes_deleted_members() -> Result<(), IdentityError> {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(1, Some("a"), None, 1));
        ledger.insert(secondary(2, 1, Some("b"), None, 2));
        ledger.insert(secondary(3, 1, Some("c"), None, 3));
        ledger.soft_delete(ContactId(2), at(4))?;

        let ids = ledger.load_cluster(ContactId(1))?.iter().map(|r| r.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);
        Ok(())
    }

    // Test IDs: TLED-006
    #[test]
    fn soft_delete_refuses_anchor_with_live_secondaries() -> Result<(), IdentityError> {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(1, Some("a"), None, 1));
        ledger.insert(secondary(2, 1, Some("b"), None, 2));

        let refused = ledger.soft_delete(ContactId(1), at(3));
        assert!(matches!(refused, Err(IdentityError::Precondition(_))));
        assert!(ledger.get(ContactId(1)).is_some_and(ContactRecord::is_live));

        ledger.soft_delete(ContactId(2), at(4))?;
        ledger.soft_delete(ContactId(1), at(5))?;
        assert!(ledger.load_cluster(ContactId(1))?.is_empty());
        Ok(())
    }

    // Test IDs: TLED-005
    #[test]
    fn run_atomically_discards_changes_on_failure() {
        let mut ledger = MemoryLedger::new();
        ledger.insert(primary(1, Some("a"), None, 1));
        ledger.insert(primary(2, Some("b"), None, 2));

        let result: Result<(), IdentityError> = ledger.run_atomically(|ledger| {
            ledger.relink(ContactId(2), Relink::onto(ContactId(1), at(5)))?;
            ledger.relink(ContactId(7), Relink::onto(ContactId(1), at(5)))
        });

        assert!(result.is_err());
        assert_eq!(
            ledger.get(ContactId(2)).map(|record| record.link_precedence),
            Some(LinkPrecedence::Primary)
        );
    }
}
