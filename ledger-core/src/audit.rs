//! Append-only, hash-chained audit log. Building a record is a pure
//! operation; persisting it and locating the predecessor is the store's job
//! (see `store::LedgerStore::append_audit`), which must run in the same
//! transaction as the mutation the record describes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::types::{AuditId, UserId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    OrderAccepted,
    OrderCancelled,
    OrderRejected,
    FundsDebit,
    FundsCredit,
    HoldingsReserved,
    HoldingsReleased,
    FillApplied,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::OrderAccepted => "ORDER_ACCEPTED",
            AuditAction::OrderCancelled => "ORDER_CANCELLED",
            AuditAction::OrderRejected => "ORDER_REJECTED",
            AuditAction::FundsDebit => "FUNDS_DEBIT",
            AuditAction::FundsCredit => "FUNDS_CREDIT",
            AuditAction::HoldingsReserved => "HOLDINGS_RESERVED",
            AuditAction::HoldingsReleased => "HOLDINGS_RELEASED",
            AuditAction::FillApplied => "FILL_APPLIED",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Option<AuditId>,
    pub actor_id: Option<UserId>,
    pub target_id: UserId,
    pub action: AuditAction,
    pub description: String,
    pub details: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Canonical JSON with sorted keys and a stable RFC-3339 UTC timestamp. This
/// is exactly what gets hashed, so any reordering here breaks every
/// previously-computed hash.
#[derive(Serialize)]
struct CanonicalPayload<'a> {
    actor_id: Option<UserId>,
    target_id: UserId,
    action: String,
    description: &'a str,
    details: &'a BTreeMap<String, Value>,
    prev_hash: Option<&'a str>,
    ts: String,
}

pub fn canonical_payload(
    actor_id: Option<UserId>,
    target_id: UserId,
    action: AuditAction,
    description: &str,
    details: &BTreeMap<String, Value>,
    prev_hash: Option<&str>,
    created_at: OffsetDateTime,
) -> Vec<u8> {
    let payload = CanonicalPayload {
        actor_id,
        target_id,
        action: action.to_string(),
        description,
        details,
        prev_hash,
        ts: created_at
            .format(&time::format_description::well_known::Rfc3339)
            .expect("rfc3339 formatting never fails for a valid OffsetDateTime"),
    };
    // serde_json serializes struct fields in declaration order (stable),
    // and BTreeMap fields in key order, so this is already canonical.
    serde_json::to_vec(&payload).expect("canonical payload is always representable as JSON")
}

pub fn compute_hash(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    hex::encode(digest)
}

/// Builds the next record in the chain given the predecessor's hash (`None`
/// for the very first row in the table).
pub fn build_record(
    actor_id: Option<UserId>,
    target_id: UserId,
    action: AuditAction,
    description: impl Into<String>,
    details: BTreeMap<String, Value>,
    prev_hash: Option<String>,
    created_at: OffsetDateTime,
) -> AuditRecord {
    let description = description.into();
    let payload = canonical_payload(
        actor_id,
        target_id,
        action,
        &description,
        &details,
        prev_hash.as_deref(),
        created_at,
    );
    let hash = compute_hash(&payload);
    AuditRecord {
        id: None,
        actor_id,
        target_id,
        action,
        description,
        details,
        created_at,
        prev_hash,
        hash,
    }
}

/// Walks a chain in insertion order verifying each row's hash and its link to
/// the predecessor. Returns the index of the first broken row, if any.
/// Tamper-evidence only: this proves nothing about who wrote a valid row.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), usize> {
    let mut prev: Option<&str> = None;
    for (i, record) in records.iter().enumerate() {
        if record.prev_hash.as_deref() != prev {
            return Err(i);
        }
        let payload = canonical_payload(
            record.actor_id,
            record.target_id,
            record.action,
            &record.description,
            &record.details,
            record.prev_hash.as_deref(),
            record.created_at,
        );
        if compute_hash(&payload) != record.hash {
            return Err(i);
        }
        prev = Some(&record.hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn chain_of_two_records_verifies() {
        let first = build_record(
            None,
            1,
            AuditAction::OrderAccepted,
            "accepted",
            BTreeMap::new(),
            None,
            ts(),
        );
        let second = build_record(
            None,
            1,
            AuditAction::FundsDebit,
            "debited",
            BTreeMap::new(),
            Some(first.hash.clone()),
            ts(),
        );
        assert!(verify_chain(&[first, second]).is_ok());
    }

    #[test]
    fn tampering_with_a_row_breaks_the_chain_from_that_point() {
        let first = build_record(
            None,
            1,
            AuditAction::OrderAccepted,
            "accepted",
            BTreeMap::new(),
            None,
            ts(),
        );
        let mut second = build_record(
            None,
            1,
            AuditAction::FundsDebit,
            "debited",
            BTreeMap::new(),
            Some(first.hash.clone()),
            ts(),
        );
        second.description = "tampered".to_string();
        assert_eq!(verify_chain(&[first, second]), Err(1));
    }
}
