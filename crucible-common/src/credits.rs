//! Credit ledger types and pricing.
//!
//! The ledger is append-only and is the sole source of truth for a user's
//! balance: the balance equals the sum of signed ledger amounts, and every
//! entry snapshots `balance_after` for auditability.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    // Credits in
    SignupBonus,
    Grant,
    Purchase,
    Refund,
    DailyBonus,
    // Credits out
    Submission,
    Rerun,
}

impl CreditReason {
    /// Cost in credits for debit reasons; zero for credit-side reasons.
    pub fn cost(self) -> i64 {
        match self {
            CreditReason::Submission => 5,
            CreditReason::Rerun => 2,
            _ => 0,
        }
    }
}

/// Append-only record of one credit delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "userId")]
    pub user_id: ObjectId,
    pub direction: CreditDirection,
    /// Always positive; the direction carries the sign.
    pub amount: i64,
    pub reason: CreditReason,
    /// Id of the causing job, when one exists.
    #[serde(rename = "referenceId", skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<ObjectId>,
    #[serde(rename = "balanceAfter")]
    pub balance_after: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn debit(
        user_id: ObjectId,
        amount: i64,
        reason: CreditReason,
        reference_id: Option<ObjectId>,
        balance_after: i64,
    ) -> Self {
        Self {
            user_id,
            direction: CreditDirection::Debit,
            amount,
            reason,
            reference_id,
            balance_after,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn credit(
        user_id: ObjectId,
        amount: i64,
        reason: CreditReason,
        reference_id: Option<ObjectId>,
        balance_after: i64,
    ) -> Self {
        Self {
            user_id,
            direction: CreditDirection::Credit,
            amount,
            reason,
            reference_id,
            balance_after,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Amount with the direction applied.
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            CreditDirection::Credit => self.amount,
            CreditDirection::Debit => -self.amount,
        }
    }
}
