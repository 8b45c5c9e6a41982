//! MongoDB credit store: user balances plus the append-only ledger.

use crate::{CreditStore, Result, StoreError};
use async_trait::async_trait;
use crucible_common::credits::{CreditDirection, CreditReason, LedgerEntry};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};

const USERS: &str = "users";
const LEDGER: &str = "credit_transactions";

pub struct MongoCreditStore {
    users: Collection<Document>,
    ledger: Collection<Document>,
}

impl MongoCreditStore {
    pub fn new(db: &Database) -> Self {
        Self {
            users: db.collection(USERS),
            ledger: db.collection(LEDGER),
        }
    }
}

#[async_trait]
impl CreditStore for MongoCreditStore {
    async fn conditional_debit(&self, user_id: ObjectId, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(StoreError::Malformed(
                "debit amount must be positive".to_string(),
            ));
        }

        // The $gte guard and the $inc land in one atomic update; there is
        // no read-then-write window for concurrent submissions to race.
        let updated = self
            .users
            .find_one_and_update(
                doc! { "_id": user_id, "credits": { "$gte": amount } },
                doc! { "$inc": { "credits": -amount } },
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(user) => balance_of(&user),
            None => Err(StoreError::InsufficientCredits),
        }
    }

    async fn add(&self, user_id: ObjectId, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(StoreError::Malformed(
                "credit amount must be positive".to_string(),
            ));
        }

        let updated = self
            .users
            .find_one_and_update(
                doc! { "_id": user_id },
                doc! { "$inc": { "credits": amount } },
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(user) => balance_of(&user),
            None => Err(StoreError::NotFound("user")),
        }
    }

    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        self.ledger.insert_one(entry_to_doc(entry)).await?;
        Ok(())
    }

    async fn has_sufficient(&self, user_id: ObjectId, amount: i64) -> Result<bool> {
        let count = self
            .users
            .count_documents(doc! { "_id": user_id, "credits": { "$gte": amount } })
            .await?;
        Ok(count > 0)
    }
}

fn balance_of(user: &Document) -> Result<i64> {
    match user.get("credits") {
        Some(Bson::Int64(balance)) => Ok(*balance),
        Some(Bson::Int32(balance)) => Ok(i64::from(*balance)),
        _ => Err(StoreError::Malformed(
            "user document missing 'credits'".to_string(),
        )),
    }
}

fn entry_to_doc(entry: &LedgerEntry) -> Document {
    let mut document = doc! {
        "userId": entry.user_id,
        "type": direction_str(entry.direction),
        "amount": entry.amount,
        "reason": reason_str(entry.reason),
        "balanceAfter": entry.balance_after,
        "created_at": DateTime::from_chrono(entry.created_at),
    };

    if let Some(reference) = entry.reference_id {
        document.insert("referenceId", reference);
    }
    if !entry.metadata.is_empty() {
        let mut metadata = Document::new();
        for (key, value) in &entry.metadata {
            if let Ok(bson) = Bson::try_from(value.clone()) {
                metadata.insert(key, bson);
            }
        }
        document.insert("metadata", metadata);
    }

    document
}

fn direction_str(direction: CreditDirection) -> &'static str {
    match direction {
        CreditDirection::Credit => "credit",
        CreditDirection::Debit => "debit",
    }
}

fn reason_str(reason: CreditReason) -> &'static str {
    match reason {
        CreditReason::SignupBonus => "signup_bonus",
        CreditReason::Grant => "grant",
        CreditReason::Purchase => "purchase",
        CreditReason::Refund => "refund",
        CreditReason::DailyBonus => "daily_bonus",
        CreditReason::Submission => "submission",
        CreditReason::Rerun => "rerun",
    }
}
