use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ContactId, ContactRecord, IdentityError, LinkPrecedence};

/// One identity cluster: a single PRIMARY anchor plus the SECONDARY records linked to it.
///
/// Only [`Cluster::assemble`] builds a cluster, so every value of this type has exactly one
/// PRIMARY and no SECONDARY pointing anywhere but the anchor.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Cluster {
    primary: ContactRecord,
    secondaries: Vec<ContactRecord>,
}

impl Cluster {
    /// Build a cluster from the live records loaded for `anchor`.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvariantBreach`] when the anchor is missing or not PRIMARY,
    /// when more than one PRIMARY is present, or when a SECONDARY links elsewhere.
    pub fn assemble(anchor: ContactId, records: Vec<ContactRecord>) -> Result<Self, IdentityError> {
        let mut primary: Option<ContactRecord> = None;
        let mut secondaries = Vec::with_capacity(records.len());

        for record in records.into_iter().filter(ContactRecord::is_live) {
            match record.link_precedence {
                LinkPrecedence::Primary => {
                    if record.id != anchor {
                        return Err(IdentityError::InvariantBreach(format!(
                            "primary contact {} loaded into cluster {anchor}",
                            record.id
                        )));
                    }
                    if let Some(linked_id) = record.linked_id {
                        return Err(IdentityError::InvariantBreach(format!(
                            "primary contact {} carries linked_id {linked_id}",
                            record.id
                        )));
                    }
                    if primary.replace(record).is_some() {
                        return Err(IdentityError::InvariantBreach(format!(
                            "cluster {anchor} has more than one primary"
                        )));
                    }
                }
                LinkPrecedence::Secondary => {
                    if record.id == anchor {
                        return Err(IdentityError::InvariantBreach(format!(
                            "anchor {anchor} is a secondary contact; linked records would form a chain"
                        )));
                    }
                    if record.linked_id != Some(anchor) {
                        return Err(IdentityError::InvariantBreach(format!(
                            "secondary contact {} does not link to anchor {anchor}",
                            record.id
                        )));
                    }
                    secondaries.push(record);
                }
            }
        }

        let Some(primary) = primary else {
            return Err(IdentityError::InvariantBreach(format!(
                "cluster {anchor} has no live primary contact"
            )));
        };

        secondaries.sort_by_key(ContactRecord::age_key);
        Ok(Self { primary, secondaries })
    }

    #[must_use]
    pub fn anchor_id(&self) -> ContactId {
        self.primary.id
    }

    #[must_use]
    pub fn primary(&self) -> &ContactRecord {
        &self.primary
    }

    #[must_use]
    pub fn secondaries(&self) -> &[ContactRecord] {
        &self.secondaries
    }

    /// PRIMARY first, then SECONDARY records oldest first.
    pub fn members(&self) -> impl Iterator<Item = &ContactRecord> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.secondaries.len() + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains_email(&self, email: &str) -> bool {
        self.members().any(|record| record.email.as_deref() == Some(email))
    }

    #[must_use]
    pub fn contains_phone_number(&self, phone_number: &str) -> bool {
        self.members().any(|record| record.phone_number.as_deref() == Some(phone_number))
    }

    /// Append a freshly created SECONDARY.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvariantBreach`] when the record does not link to this anchor.
    pub fn push_secondary(&mut self, record: ContactRecord) -> Result<(), IdentityError> {
        if record.link_precedence != LinkPrecedence::Secondary
            || record.linked_id != Some(self.anchor_id())
        {
            return Err(IdentityError::InvariantBreach(format!(
                "contact {} cannot join cluster {}",
                record.id,
                self.anchor_id()
            )));
        }
        self.secondaries.push(record);
        self.secondaries.sort_by_key(ContactRecord::age_key);
        Ok(())
    }
}

/// Distinct anchor ids touched by `matched`, in order of first appearance.
///
/// # Errors
/// Returns [`IdentityError::InvariantBreach`] when a SECONDARY has no `linked_id`.
pub fn group_by_anchor(matched: &[ContactRecord]) -> Result<Vec<ContactId>, IdentityError> {
    let mut seen = BTreeSet::new();
    let mut anchors = Vec::new();
    for record in matched {
        let anchor = record.anchor_id()?;
        if seen.insert(anchor) {
            anchors.push(anchor);
        }
    }
    Ok(anchors)
}

/// Externally visible projection of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

impl IdentityView {
    #[must_use]
    pub fn project(cluster: &Cluster) -> Self {
        let mut emails = Vec::new();
        let mut phone_numbers = Vec::new();
        for record in cluster.members() {
            push_unique(&mut emails, record.email.as_deref());
            push_unique(&mut phone_numbers, record.phone_number.as_deref());
        }

        Self {
            primary_contact_id: cluster.anchor_id(),
            emails,
            phone_numbers,
            secondary_contact_ids: cluster.secondaries().iter().map(|record| record.id).collect(),
        }
    }
}

fn push_unique(values: &mut Vec<String>, candidate: Option<&str>) {
    let Some(candidate) = candidate else {
        return;
    };
    if !values.iter().any(|value| value == candidate) {
        values.push(candidate.to_string());
    }
}
