use serde::Serialize;
use time::OffsetDateTime;

use crate::cluster::{group_by_anchor, Cluster, IdentityView};
use crate::ledger::ContactLedger;
use crate::{ContactId, ContactRecord, IdentifyRequest, IdentityError, NewContact, Relink};

/// What one `identify` call changed.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    CreatedPrimary,
    AddedSecondary {
        contact_id: ContactId,
    },
    Unchanged,
    Merged {
        absorbed_primaries: Vec<ContactId>,
        relinked_secondaries: Vec<ContactId>,
        added_secondary: Option<ContactId>,
    },
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub cluster: Cluster,
}

impl Resolution {
    #[must_use]
    pub fn view(&self) -> IdentityView {
        IdentityView::project(&self.cluster)
    }

    #[must_use]
    pub fn created_records(&self) -> usize {
        match &self.outcome {
            ResolutionOutcome::CreatedPrimary | ResolutionOutcome::AddedSecondary { .. } => 1,
            ResolutionOutcome::Merged { added_secondary, .. } => {
                usize::from(added_secondary.is_some())
            }
            ResolutionOutcome::Unchanged => 0,
        }
    }
}

/// True when the request carries an email or phone no member of `clusters` already has.
#[must_use]
pub fn needs_new_secondary(clusters: &[Cluster], request: &IdentifyRequest) -> bool {
    let email_is_new = request
        .email()
        .is_some_and(|email| !clusters.iter().any(|cluster| cluster.contains_email(email)));
    let phone_is_new = request.phone_number().is_some_and(|phone_number| {
        !clusters.iter().any(|cluster| cluster.contains_phone_number(phone_number))
    });
    email_is_new || phone_is_new
}

/// Index of the cluster whose PRIMARY is oldest, ties broken by lower id.
#[must_use]
pub fn select_surviving_anchor(clusters: &[Cluster]) -> Option<usize> {
    clusters
        .iter()
        .enumerate()
        .min_by_key(|(_, cluster)| cluster.primary().age_key())
        .map(|(index, _)| index)
}

/// Resolve `request` against the ledger and return the final cluster.
///
/// Runs match, group, resolve and (through [`Resolution::view`]) project. The caller owns
/// the transaction boundary: on any error the ledger may hold partial writes that must be
/// rolled back.
///
/// # Errors
/// Returns [`IdentityError::Precondition`] when neither email nor phone is given,
/// [`IdentityError::InvariantBreach`] when stored clusters are malformed, and any ledger error.
pub fn identify<L: ContactLedger>(
    ledger: &mut L,
    request: &IdentifyRequest,
    now: OffsetDateTime,
) -> Result<Resolution, L::Error> {
    if request.is_empty() {
        return Err(IdentityError::Precondition(
            "at least one of email or phoneNumber must be provided".to_string(),
        )
        .into());
    }

    let matched = ledger.find_live(request.email(), request.phone_number())?;
    let anchors = group_by_anchor(&matched)?;

    let mut clusters = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        let members = ledger.load_cluster(anchor)?;
        clusters.push(Cluster::assemble(anchor, members)?);
    }

    match clusters.len() {
        0 => {
            let created = ledger.create_record(NewContact::primary(request, now))?;
            let anchor = created.id;
            Ok(Resolution {
                outcome: ResolutionOutcome::CreatedPrimary,
                cluster: Cluster::assemble(anchor, vec![created])?,
            })
        }
        1 => extend_single(ledger, clusters.remove(0), request, now),
        _ => merge(ledger, clusters, request, now),
    }
}

fn extend_single<L: ContactLedger>(
    ledger: &mut L,
    mut cluster: Cluster,
    request: &IdentifyRequest,
    now: OffsetDateTime,
) -> Result<Resolution, L::Error> {
    if !needs_new_secondary(std::slice::from_ref(&cluster), request) {
        return Ok(Resolution { outcome: ResolutionOutcome::Unchanged, cluster });
    }

    let created =
        ledger.create_record(NewContact::secondary(request, cluster.anchor_id(), now))?;
    let contact_id = created.id;
    cluster.push_secondary(created)?;
    Ok(Resolution { outcome: ResolutionOutcome::AddedSecondary { contact_id }, cluster })
}

fn merge<L: ContactLedger>(
    ledger: &mut L,
    clusters: Vec<Cluster>,
    request: &IdentifyRequest,
    now: OffsetDateTime,
) -> Result<Resolution, L::Error> {
    let Some(survivor_index) = select_surviving_anchor(&clusters) else {
        return Err(
            IdentityError::InvariantBreach("merge called without clusters".to_string()).into()
        );
    };
    let survivor = clusters[survivor_index].anchor_id();

    let mut absorbed_primaries = Vec::new();
    let mut relinked_secondaries = Vec::new();

    for cluster in clusters.iter().filter(|cluster| cluster.anchor_id() != survivor) {
        ledger.relink(cluster.anchor_id(), Relink::onto(survivor, now))?;
        absorbed_primaries.push(cluster.anchor_id());
    }

    for cluster in clusters.iter().filter(|cluster| cluster.anchor_id() != survivor) {
        for secondary in cluster.secondaries() {
            if secondary.linked_id != Some(survivor) {
                ledger.relink(secondary.id, Relink::onto(survivor, now))?;
                relinked_secondaries.push(secondary.id);
            }
        }
    }

    let added_secondary = if needs_new_secondary(&clusters, request) {
        Some(ledger.create_record(NewContact::secondary(request, survivor, now))?.id)
    } else {
        None
    };

    let merged = Cluster::assemble(survivor, ledger.load_cluster(survivor)?)?;
    verify_absorbed(&merged, &clusters)?;

    Ok(Resolution {
        outcome: ResolutionOutcome::Merged {
            absorbed_primaries,
            relinked_secondaries,
            added_secondary,
        },
        cluster: merged,
    })
}

/// Every record of the input clusters must now hang directly off the survivor.
fn verify_absorbed(merged: &Cluster, clusters: &[Cluster]) -> Result<(), IdentityError> {
    let missing = clusters
        .iter()
        .flat_map(Cluster::members)
        .map(|record: &ContactRecord| record.id)
        .find(|id| !merged.members().any(|member| member.id == *id));

    match missing {
        Some(id) => Err(IdentityError::InvariantBreach(format!(
            "contact {id} was not flattened onto anchor {}",
            merged.anchor_id()
        ))),
        None => Ok(()),
    }
}
