use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod cluster;
mod ledger;
mod resolver;

pub use cluster::{group_by_anchor, Cluster, IdentityView};
pub use ledger::{ContactLedger, MemoryLedger};
pub use resolver::{identify, needs_new_secondary, select_surviving_anchor, Resolution, ResolutionOutcome};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("invariant breach: {0}")]
    InvariantBreach(String),
    #[error("contact {0} is missing or deleted")]
    StaleRecord(ContactId),
    #[error("precondition violated: {0}")]
    Precondition(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Id of the cluster anchor this record claims to belong to.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvariantBreach`] for a SECONDARY without `linked_id`.
    pub fn anchor_id(&self) -> Result<ContactId, IdentityError> {
        match self.link_precedence {
            LinkPrecedence::Primary => Ok(self.id),
            LinkPrecedence::Secondary => self.linked_id.ok_or_else(|| {
                IdentityError::InvariantBreach(format!(
                    "secondary contact {} has no linked_id",
                    self.id
                ))
            }),
        }
    }

    /// Matcher predicate: live and exactly equal on email or phone.
    #[must_use]
    pub fn matches(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        if !self.is_live() {
            return false;
        }
        let email_hit = email.is_some() && self.email.as_deref() == email;
        let phone_hit = phone_number.is_some() && self.phone_number.as_deref() == phone_number;
        email_hit || phone_hit
    }

    /// Ordering key for cluster membership and anchor selection.
    #[must_use]
    pub fn age_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self { email: email.map(str::to_string), phone_number: phone_number.map(str::to_string) }
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone_number.is_none()
    }
}

/// Fields for a record the ledger has not assigned an id to yet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    pub created_at: OffsetDateTime,
}

impl NewContact {
    #[must_use]
    pub fn primary(request: &IdentifyRequest, now: OffsetDateTime) -> Self {
        Self {
            email: request.email.clone(),
            phone_number: request.phone_number.clone(),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn secondary(request: &IdentifyRequest, anchor: ContactId, now: OffsetDateTime) -> Self {
        Self {
            email: request.email.clone(),
            phone_number: request.phone_number.clone(),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(anchor),
            created_at: now,
        }
    }

    #[must_use]
    pub fn into_record(self, id: ContactId) -> ContactRecord {
        ContactRecord {
            id,
            email: self.email,
            phone_number: self.phone_number,
            link_precedence: self.link_precedence,
            linked_id: self.linked_id,
            created_at: self.created_at,
            updated_at: self.created_at,
            deleted_at: None,
        }
    }
}

/// Re-pointing of an existing record onto a surviving anchor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Relink {
    pub link_precedence: LinkPrecedence,
    pub linked_id: ContactId,
    pub updated_at: OffsetDateTime,
}

impl Relink {
    #[must_use]
    pub fn onto(anchor: ContactId, updated_at: OffsetDateTime) -> Self {
        Self { link_precedence: LinkPrecedence::Secondary, linked_id: anchor, updated_at }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{at, primary, secondary};
    use super::*;

    // Test IDs: TMAT-001
    #[test]
    fn matches_on_either_field_and_ignores_absent_values() {
        let record = primary(1, Some("a@x.com"), Some("555"), 0);

        assert!(record.matches(Some("a@x.com"), None));
        assert!(record.matches(None, Some("555")));
        assert!(record.matches(Some("other@x.com"), Some("555")));
        assert!(!record.matches(Some("other@x.com"), Some("999")));
        assert!(!record.matches(None, None));
    }

    // Test IDs: TMAT-002
    #[test]
    fn absent_request_field_does_not_match_null_column() {
        let record = primary(1, None, Some("555"), 0);
        assert!(!record.matches(None, Some("999")));
        assert!(!record.matches(Some("a@x.com"), None));
    }

    // Test IDs: TMAT-003
    #[test]
    fn deleted_records_never_match() {
        let mut record = primary(1, Some("a@x.com"), None, 0);
        record.deleted_at = Some(at(5));
        assert!(!record.matches(Some("a@x.com"), None));
    }

    // Test IDs: TMOD-001
    #[test]
    fn anchor_id_requires_linked_id_on_secondary() {
        let mut record = secondary(2, 1, Some("a@x.com"), None, 1);
        assert_eq!(record.anchor_id(), Ok(ContactId(1)));

        record.linked_id = None;
        assert!(matches!(record.anchor_id(), Err(IdentityError::InvariantBreach(_))));
    }

    // Test IDs: TMOD-002
    #[test]
    fn link_precedence_round_trips_through_strings() {
        for precedence in [LinkPrecedence::Primary, LinkPrecedence::Secondary] {
            assert_eq!(LinkPrecedence::parse(precedence.as_str()), Some(precedence));
        }
        assert_eq!(LinkPrecedence::parse("tertiary"), None);
    }

    // Test IDs: TMOD-003
    #[test]
    fn identify_request_uses_camel_case_on_the_wire() -> Result<(), serde_json::Error> {
        let request: IdentifyRequest =
            serde_json::from_str(r#"{"email":"a@x.com","phoneNumber":"555"}"#)?;
        assert_eq!(request, IdentifyRequest::new(Some("a@x.com"), Some("555")));

        let only_phone: IdentifyRequest = serde_json::from_str(r#"{"phoneNumber":"555"}"#)?;
        assert_eq!(only_phone.email(), None);
        assert!(!only_phone.is_empty());
        Ok(())
    }
}
