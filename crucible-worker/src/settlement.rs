//! Credit settlement with compensation.
//!
//! The debit and the ledger append are separate writes: the conditional
//! debit is atomic on its own, and a failed ledger append is compensated
//! by re-crediting the same amount. No transaction spans the user and
//! ledger collections.

use bson::oid::ObjectId;
use crucible_common::credits::{CreditReason, LedgerEntry};
use crucible_store::{CreditStore, Result};
use std::collections::HashMap;

/// Debit `amount` from the user and append the matching ledger entry.
///
/// If the append fails after the debit succeeded, the amount is credited
/// back and the append error is returned.
pub async fn debit_and_log(
    credits: &dyn CreditStore,
    user_id: ObjectId,
    amount: i64,
    reason: CreditReason,
    reference_id: Option<ObjectId>,
    metadata: HashMap<String, serde_json::Value>,
) -> Result<i64> {
    let balance_after = credits.conditional_debit(user_id, amount).await?;

    let entry = LedgerEntry::debit(user_id, amount, reason, reference_id, balance_after)
        .with_metadata(metadata);

    if let Err(append_err) = credits.append_ledger(&entry).await {
        tracing::warn!(
            user = %user_id,
            amount,
            error = %append_err,
            "ledger append failed after debit; compensating"
        );
        if let Err(comp_err) = credits.add(user_id, amount).await {
            tracing::error!(
                user = %user_id,
                amount,
                error = %comp_err,
                "compensation failed; balance and ledger diverge"
            );
        }
        return Err(append_err);
    }

    Ok(balance_after)
}

/// Credit `amount` to the user and append the matching ledger entry.
pub async fn credit_and_log(
    credits: &dyn CreditStore,
    user_id: ObjectId,
    amount: i64,
    reason: CreditReason,
    reference_id: Option<ObjectId>,
    metadata: HashMap<String, serde_json::Value>,
) -> Result<i64> {
    let balance_after = credits.add(user_id, amount).await?;

    let entry = LedgerEntry::credit(user_id, amount, reason, reference_id, balance_after)
        .with_metadata(metadata);
    credits.append_ledger(&entry).await?;

    Ok(balance_after)
}
