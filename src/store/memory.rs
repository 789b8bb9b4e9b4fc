//! In-memory signature store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, SigningError};
use crate::models::signature::{SignatureFilter, SignatureRecord};
use crate::store::{RecordMutation, RecordRotation, SignatureStore};

/// Process-local implementation of [`SignatureStore`].
///
/// A single write lock stands in for row locking, which is enough to give
/// every operation the same atomicity as the PostgreSQL store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySignatureStore {
    records: Arc<RwLock<HashMap<String, SignatureRecord>>>,
}

impl InMemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SignatureStore for InMemorySignatureStore {
    async fn insert(&self, record: SignatureRecord) -> Result<SignatureRecord> {
        let mut records = self.records.write().await;

        if records.contains_key(&record.signature) {
            return Err(SigningError::DuplicateSignature);
        }

        records.insert(record.signature.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_signature(&self, signature: &str) -> Result<Option<SignatureRecord>> {
        let records = self.records.read().await;
        Ok(records.get(signature).cloned())
    }

    async fn update(&self, record: &SignatureRecord) -> Result<SignatureRecord> {
        let mut records = self.records.write().await;

        let stored = records
            .get_mut(&record.signature)
            .ok_or(SigningError::KeyDoesNotExist)?;

        // Identity and issuance data are immutable
        let mut updated = record.clone();
        updated.id = stored.id;
        updated.created_at = stored.created_at;
        *stored = updated.clone();

        Ok(updated)
    }

    async fn modify(
        &self,
        signature: &str,
        mutation: RecordMutation,
    ) -> Result<Option<SignatureRecord>> {
        let mut records = self.records.write().await;

        let Some(stored) = records.get_mut(signature) else {
            return Ok(None);
        };

        let mut working = stored.clone();
        mutation(&mut working)?;
        *stored = working.clone();

        Ok(Some(working))
    }

    async fn replace(&self, signature: &str, rotation: RecordRotation) -> Result<SignatureRecord> {
        let mut records = self.records.write().await;

        let mut old = records
            .get(signature)
            .cloned()
            .ok_or(SigningError::KeyDoesNotExist)?;

        let successor = rotation(&mut old)?;
        if records.contains_key(&successor.signature) {
            return Err(SigningError::DuplicateSignature);
        }

        records.insert(old.signature.clone(), old);
        records.insert(successor.signature.clone(), successor.clone());

        Ok(successor)
    }

    async fn list_all(&self, filter: &SignatureFilter) -> Result<Vec<SignatureRecord>> {
        let records = self.records.read().await;

        let mut result: Vec<SignatureRecord> = records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(result)
    }

    async fn delete(&self, signature: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(signature).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(signature: &str) -> SignatureRecord {
        SignatureRecord::issue(
            signature.to_string(),
            "test".to_string(),
            0,
            true,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemorySignatureStore::new();

        store.insert(record("aa")).await.unwrap();

        let found = store.find_by_signature("aa").await.unwrap().unwrap();
        assert_eq!(found.signature, "aa");
        assert!(store.find_by_signature("bb").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_duplicate() {
        let store = InMemorySignatureStore::new();
        store.insert(record("aa")).await.unwrap();

        let result = store.insert(record("aa")).await;

        assert!(matches!(result, Err(SigningError::DuplicateSignature)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let store = InMemorySignatureStore::new();
        let original = store.insert(record("aa")).await.unwrap();

        let mut changed = original.clone();
        changed.id = uuid::Uuid::new_v4();
        changed.active = false;
        changed.scope = "api".to_string();

        let updated = store.update(&changed).await.unwrap();
        assert_eq!(updated.id, original.id);
        assert!(!updated.active);
        assert_eq!(updated.scope, "api");

        let missing = store.update(&record("bb")).await;
        assert!(matches!(missing, Err(SigningError::KeyDoesNotExist)));
    }

    #[tokio::test]
    async fn test_modify_failure_leaves_record() {
        let store = InMemorySignatureStore::new();
        store.insert(record("aa")).await.unwrap();

        let mutation: RecordMutation = Box::new(|record: &mut SignatureRecord| {
            record.active = false;
            Err(SigningError::RateLimitExceeded {
                retry_after_secs: 1,
            })
        });
        let result = store.modify("aa", mutation).await;
        assert!(result.is_err());

        let stored = store.find_by_signature("aa").await.unwrap().unwrap();
        assert!(stored.active);
    }

    #[tokio::test]
    async fn test_modify_missing_returns_none() {
        let store = InMemorySignatureStore::new();

        let mutation: RecordMutation = Box::new(|_: &mut SignatureRecord| Ok(()));
        let result = store.modify("aa", mutation).await.unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_replace_rejects_duplicate_successor() {
        let store = InMemorySignatureStore::new();
        store.insert(record("aa")).await.unwrap();
        store.insert(record("bb")).await.unwrap();

        let rotation: RecordRotation = Box::new(|old: &mut SignatureRecord| {
            old.active = false;
            Ok(record("bb"))
        });
        let result = store.replace("aa", rotation).await;
        assert!(matches!(result, Err(SigningError::DuplicateSignature)));

        // Old key must still be active after the failed rotation
        let old = store.find_by_signature("aa").await.unwrap().unwrap();
        assert!(old.active);
    }

    #[tokio::test]
    async fn test_list_all_ordered_and_filtered() {
        let store = InMemorySignatureStore::new();
        let now = Utc::now();

        let mut older = record("aa");
        older.created_at = now - Duration::hours(1);
        let mut inactive = record("bb");
        inactive.active = false;
        store.insert(record("cc")).await.unwrap();
        store.insert(older).await.unwrap();
        store.insert(inactive).await.unwrap();

        let all = store.list_all(&SignatureFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].signature, "aa");

        let active = store
            .list_all(&SignatureFilter::active_only())
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|record| record.active));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemorySignatureStore::new();
        store.insert(record("aa")).await.unwrap();

        assert!(store.delete("aa").await.unwrap());
        assert!(!store.delete("aa").await.unwrap());
        assert!(store.is_empty().await);
    }
}
