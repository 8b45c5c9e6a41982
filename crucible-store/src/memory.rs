//! In-memory store implementations.
//!
//! The worker takes stores as trait objects, so tests wire these instead
//! of MongoDB. They honor the same contracts, including the conditional
//! debit, and add failure injection for the compensation path.

use crate::{ApiLogStore, ApiLogTerminal, CreditStore, JobStore, Result, StoreError};
use async_trait::async_trait;
use crucible_common::job::Job;
use crucible_common::LedgerEntry;
use mongodb::bson::oid::ObjectId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<ObjectId, Job>>,
    fail_saves: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, id: ObjectId) -> Option<Job> {
        self.jobs.lock().expect("job map").get(&id).cloned()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.lock().expect("job map").insert(job.id, job);
    }

    /// Statuses in save order is not tracked; this is the current state.
    pub fn all(&self) -> Vec<Job> {
        self.jobs.lock().expect("job map").values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound("job store offline"));
        }
        self.jobs.lock().expect("job map").insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>> {
        Ok(self.get(id))
    }

    async fn find_by_id_and_user(&self, id: ObjectId, user_id: ObjectId) -> Result<Option<Job>> {
        Ok(self.get(id).filter(|job| job.user_id == user_id))
    }

    async fn delete(&self, id: ObjectId) -> Result<()> {
        self.jobs.lock().expect("job map").remove(&id);
        Ok(())
    }

    async fn count_by_user(&self, user_id: ObjectId) -> Result<u64> {
        Ok(self
            .jobs
            .lock()
            .expect("job map")
            .values()
            .filter(|job| job.user_id == user_id)
            .count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryCreditStore {
    balances: Mutex<HashMap<ObjectId, i64>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    fail_appends: AtomicBool,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: ObjectId, balance: i64) {
        self.balances.lock().expect("balances").insert(user_id, balance);
    }

    pub fn balance(&self, user_id: ObjectId) -> i64 {
        *self
            .balances
            .lock()
            .expect("balances")
            .get(&user_id)
            .unwrap_or(&0)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().expect("ledger").clone()
    }

    /// Make every subsequent `append_ledger` fail, to exercise the debit
    /// compensation path.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn conditional_debit(&self, user_id: ObjectId, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(StoreError::Malformed(
                "debit amount must be positive".to_string(),
            ));
        }
        let mut balances = self.balances.lock().expect("balances");
        let balance = balances.entry(user_id).or_insert(0);
        if *balance < amount {
            return Err(StoreError::InsufficientCredits);
        }
        *balance -= amount;
        Ok(*balance)
    }

    async fn add(&self, user_id: ObjectId, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(StoreError::Malformed(
                "credit amount must be positive".to_string(),
            ));
        }
        let mut balances = self.balances.lock().expect("balances");
        let balance = balances.entry(user_id).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }

    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound("ledger offline"));
        }
        self.ledger.lock().expect("ledger").push(entry.clone());
        Ok(())
    }

    async fn has_sufficient(&self, user_id: ObjectId, amount: i64) -> Result<bool> {
        Ok(self.balance(user_id) >= amount)
    }
}

#[derive(Default)]
pub struct InMemoryApiLogStore {
    updates: Mutex<Vec<(ObjectId, ApiLogTerminal)>>,
}

impl InMemoryApiLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(ObjectId, ApiLogTerminal)> {
        self.updates.lock().expect("updates").clone()
    }
}

#[async_trait]
impl ApiLogStore for InMemoryApiLogStore {
    async fn update_by_job_id(&self, job_id: ObjectId, terminal: &ApiLogTerminal) -> Result<()> {
        self.updates
            .lock()
            .expect("updates")
            .push((job_id, terminal.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_debit_honors_balance() {
        let store = InMemoryCreditStore::new();
        let user = ObjectId::new();
        store.set_balance(user, 7);

        assert_eq!(store.conditional_debit(user, 5).await.unwrap(), 2);
        assert!(matches!(
            store.conditional_debit(user, 5).await,
            Err(StoreError::InsufficientCredits)
        ));
        assert_eq!(store.balance(user), 2);
    }

    #[tokio::test]
    async fn add_then_debit_round_trip() {
        let store = InMemoryCreditStore::new();
        let user = ObjectId::new();

        assert_eq!(store.add(user, 100).await.unwrap(), 100);
        assert_eq!(store.conditional_debit(user, 40).await.unwrap(), 60);
        assert!(store.has_sufficient(user, 60).await.unwrap());
        assert!(!store.has_sufficient(user, 61).await.unwrap());
    }
}
