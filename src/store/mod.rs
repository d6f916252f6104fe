//! # Proposal Persistence
//!
//! [`ProposalStore`] is the single seam to whatever keeps computed
//! proposals. The gateway calls `save` once per accepted request and maps
//! any failure to a 500; it never retries. [`InMemoryProposalStore`] is the
//! default backend.

use crate::engine::{Plan, ProposalRequest, ProposalResult};
use crate::error::{ProposalError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Everything known about one computed proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub proposal_id: Uuid,
    pub client_id: Uuid,
    pub plan: Plan,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub gross_amount: Decimal,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub net_amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ProposalRecord {
    pub fn new(request: &ProposalRequest, result: &ProposalResult) -> Self {
        Self {
            proposal_id: result.proposal_id,
            client_id: request.client_id,
            plan: request.plan,
            gross_amount: request.gross_amount,
            fee_amount: result.fee_amount,
            net_amount: result.net_amount,
            status: result.status.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Persistence collaborator
///
/// Implementations must be idempotent per `proposal_id`.
pub trait ProposalStore: Send + Sync {
    fn save(&self, record: &ProposalRecord) -> Result<()>;
}

#[derive(Debug, Default)]
struct Records {
    order: Vec<Uuid>,
    by_id: HashMap<Uuid, ProposalRecord>,
}

/// Process-local store keeping records in insertion order
#[derive(Debug, Default)]
pub struct InMemoryProposalStore {
    records: RwLock<Records>,
}

impl InMemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, proposal_id: &Uuid) -> Option<ProposalRecord> {
        self.read()
            .ok()
            .and_then(|records| records.by_id.get(proposal_id).cloned())
    }

    /// All records, oldest first
    #[cfg(test)]
    fn all(&self) -> Vec<ProposalRecord> {
        self.read()
            .map(|records| {
                records
                    .order
                    .iter()
                    .filter_map(|id| records.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| ProposalError::persistence_error("proposal store lock poisoned", None))
    }
}

impl ProposalStore for InMemoryProposalStore {
    fn save(&self, record: &ProposalRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| ProposalError::persistence_error("proposal store lock poisoned", None))?;
        if records
            .by_id
            .insert(record.proposal_id, record.clone())
            .is_none()
        {
            records.order.push(record.proposal_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compute;
    use std::str::FromStr;

    fn record(gross: &str) -> ProposalRecord {
        let request = ProposalRequest {
            client_id: Uuid::new_v4(),
            gross_amount: Decimal::from_str(gross).unwrap(),
            plan: Plan::Starter,
        };
        let result = compute(&request).unwrap();
        ProposalRecord::new(&request, &result)
    }

    #[test]
    fn test_save_keeps_insertion_order() {
        let store = InMemoryProposalStore::new();
        let first = record("10");
        let second = record("20");
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let all = store.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].proposal_id, first.proposal_id);
        assert_eq!(all[1].proposal_id, second.proposal_id);
    }

    #[test]
    fn test_save_is_idempotent_per_id() {
        let store = InMemoryProposalStore::new();
        let mut rec = record("100");
        store.save(&rec).unwrap();
        rec.status = "resaved".to_string();
        store.save(&rec).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&rec.proposal_id).unwrap().status, "resaved");
    }

    #[test]
    fn test_record_carries_request_and_result() {
        let rec = record("1000.00");
        assert_eq!(rec.fee_amount, Decimal::from_str("60.00").unwrap());
        assert_eq!(rec.net_amount, Decimal::from_str("940.00").unwrap());
        assert_eq!(rec.plan, Plan::Starter);

        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["plan"], "STARTER");
    }
}
