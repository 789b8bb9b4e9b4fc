//! PostgreSQL signature store.
//!
//! # Atomicity Guarantees
//!
//! - Inserts rely on the `UNIQUE` constraint on `signatures.signature`, never
//!   on a check-then-insert
//! - Read-modify-write operations lock the row with `SELECT ... FOR UPDATE`
//!   inside a transaction, so concurrent verifications of one key are
//!   serialized and rate-limit counters are never lost
//! - Rotation deactivates the old row and inserts the successor in the same
//!   transaction
//!
//! Serialization failures and deadlocks are retried a bounded number of times.

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::warn;

use crate::db::DbPool;
use crate::error::{Result, SigningError};
use crate::models::signature::{SignatureFilter, SignatureRecord};
use crate::store::{RecordMutation, RecordRotation, SignatureStore};

/// Attempts for a transaction that failed on lock contention.
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;

/// PostgreSQL implementation of [`SignatureStore`] over the `signatures` table.
#[derive(Debug, Clone)]
pub struct PgSignatureStore {
    pool: DbPool,
}

impl PgSignatureStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn try_modify(
        &self,
        signature: &str,
        mutation: &RecordMutation,
    ) -> Result<Option<SignatureRecord>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut record) = lock_row(&mut tx, signature).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Err(error) = mutation(&mut record) {
            tx.rollback().await?;
            return Err(error);
        }

        let updated = update_row(&mut tx, &record)
            .await?
            .ok_or(SigningError::KeyDoesNotExist)?;

        tx.commit().await?;

        Ok(Some(updated))
    }

    async fn try_replace(
        &self,
        signature: &str,
        rotation: &RecordRotation,
    ) -> Result<SignatureRecord> {
        let mut tx = self.pool.begin().await?;

        let Some(mut old) = lock_row(&mut tx, signature).await? else {
            tx.rollback().await?;
            return Err(SigningError::KeyDoesNotExist);
        };

        let successor = match rotation(&mut old) {
            Ok(successor) => successor,
            Err(error) => {
                tx.rollback().await?;
                return Err(error);
            }
        };

        update_row(&mut tx, &old)
            .await?
            .ok_or(SigningError::KeyDoesNotExist)?;

        // A failed insert drops `tx`, which rolls back the deactivation too
        let inserted = insert_row(&mut tx, &successor).await?;

        tx.commit().await?;

        Ok(inserted)
    }
}

#[async_trait]
impl SignatureStore for PgSignatureStore {
    async fn insert(&self, record: SignatureRecord) -> Result<SignatureRecord> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut conn, &record).await
    }

    async fn find_by_signature(&self, signature: &str) -> Result<Option<SignatureRecord>> {
        let record = sqlx::query_as::<_, SignatureRecord>(
            r#"
            SELECT id, signature, scope, expiration, expiration_hours, active, email,
                   created_at, last_accessed_at, rate_limit_calls, rate_limit_window_start,
                   previous_signature, rotated
            FROM signatures
            WHERE signature = $1
            "#,
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update(&self, record: &SignatureRecord) -> Result<SignatureRecord> {
        let mut conn = self.pool.acquire().await?;

        update_row(&mut conn, record)
            .await?
            .ok_or(SigningError::KeyDoesNotExist)
    }

    async fn modify(
        &self,
        signature: &str,
        mutation: RecordMutation,
    ) -> Result<Option<SignatureRecord>> {
        let mut attempt = 1;
        loop {
            match self.try_modify(signature, &mutation).await {
                Err(error) if attempt < MAX_TRANSIENT_ATTEMPTS && is_transient(&error) => {
                    warn!(attempt, error = %error, "Retrying signature update after contention");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn replace(&self, signature: &str, rotation: RecordRotation) -> Result<SignatureRecord> {
        let mut attempt = 1;
        loop {
            match self.try_replace(signature, &rotation).await {
                Err(error) if attempt < MAX_TRANSIENT_ATTEMPTS && is_transient(&error) => {
                    warn!(attempt, error = %error, "Retrying signature rotation after contention");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn list_all(&self, filter: &SignatureFilter) -> Result<Vec<SignatureRecord>> {
        // NULL parameters disable the corresponding condition
        let records = sqlx::query_as::<_, SignatureRecord>(
            r#"
            SELECT id, signature, scope, expiration, expiration_hours, active, email,
                   created_at, last_accessed_at, rate_limit_calls, rate_limit_window_start,
                   previous_signature, rotated
            FROM signatures
            WHERE ($1::boolean IS NULL OR active = $1)
              AND ($2::text IS NULL OR scope = $2)
              AND ($3::text IS NULL OR email = $3)
              AND ($4::text IS NULL OR previous_signature = $4)
              AND ($5::timestamptz IS NULL OR expiration <= $5)
            ORDER BY created_at, id
            "#,
        )
        .bind(filter.active)
        .bind(filter.scope.as_deref())
        .bind(filter.email.as_deref())
        .bind(filter.previous_signature.as_deref())
        .bind(filter.expiring_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete(&self, signature: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM signatures WHERE signature = $1")
            .bind(signature)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Lock a row for the rest of the surrounding transaction.
async fn lock_row(conn: &mut PgConnection, signature: &str) -> Result<Option<SignatureRecord>> {
    let record = sqlx::query_as::<_, SignatureRecord>(
        r#"
        SELECT id, signature, scope, expiration, expiration_hours, active, email,
               created_at, last_accessed_at, rate_limit_calls, rate_limit_window_start,
               previous_signature, rotated
        FROM signatures
        WHERE signature = $1
        FOR UPDATE
        "#,
    )
    .bind(signature)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(record)
}

async fn insert_row(conn: &mut PgConnection, record: &SignatureRecord) -> Result<SignatureRecord> {
    sqlx::query_as::<_, SignatureRecord>(
        r#"
        INSERT INTO signatures (
            id,
            signature,
            scope,
            expiration,
            expiration_hours,
            active,
            email,
            created_at,
            last_accessed_at,
            rate_limit_calls,
            rate_limit_window_start,
            previous_signature,
            rotated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id, signature, scope, expiration, expiration_hours, active, email,
                  created_at, last_accessed_at, rate_limit_calls, rate_limit_window_start,
                  previous_signature, rotated
        "#,
    )
    .bind(record.id)
    .bind(&record.signature)
    .bind(&record.scope)
    .bind(record.expiration)
    .bind(record.expiration_hours)
    .bind(record.active)
    .bind(&record.email)
    .bind(record.created_at)
    .bind(record.last_accessed_at)
    .bind(record.rate_limit_calls)
    .bind(record.rate_limit_window_start)
    .bind(&record.previous_signature)
    .bind(record.rotated)
    .fetch_one(&mut *conn)
    .await
    .map_err(|error| {
        if is_unique_violation(&error) {
            SigningError::DuplicateSignature
        } else {
            SigningError::StoreUnavailable(error)
        }
    })
}

/// Write every mutable column; identity and issuance time never change.
async fn update_row(
    conn: &mut PgConnection,
    record: &SignatureRecord,
) -> Result<Option<SignatureRecord>> {
    let updated = sqlx::query_as::<_, SignatureRecord>(
        r#"
        UPDATE signatures
        SET scope = $2,
            expiration = $3,
            expiration_hours = $4,
            active = $5,
            email = $6,
            last_accessed_at = $7,
            rate_limit_calls = $8,
            rate_limit_window_start = $9,
            previous_signature = $10,
            rotated = $11
        WHERE signature = $1
        RETURNING id, signature, scope, expiration, expiration_hours, active, email,
                  created_at, last_accessed_at, rate_limit_calls, rate_limit_window_start,
                  previous_signature, rotated
        "#,
    )
    .bind(&record.signature)
    .bind(&record.scope)
    .bind(record.expiration)
    .bind(record.expiration_hours)
    .bind(record.active)
    .bind(&record.email)
    .bind(record.last_accessed_at)
    .bind(record.rate_limit_calls)
    .bind(record.rate_limit_window_start)
    .bind(&record.previous_signature)
    .bind(record.rotated)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(updated)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}

/// Serialization failure or deadlock detected by PostgreSQL.
fn is_transient(error: &SigningError) -> bool {
    matches!(
        error,
        SigningError::StoreUnavailable(sqlx::Error::Database(db_error))
            if matches!(db_error.code().as_deref(), Some("40001") | Some("40P01"))
    )
}

#[cfg(test)]
mod tests {
    use std::env;

    use chrono::{Duration, Utc};
    use sqlx::postgres::PgPoolOptions;

    use super::*;
    use crate::services::key_generator::KeyGenerator;

    async fn test_store() -> Option<PgSignatureStore> {
        let database_url = match env::var("DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return None,
        };
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&database_url)
            .await
            .expect("connect test database");
        crate::db::run_migrations(&pool)
            .await
            .expect("apply migrations");
        Some(PgSignatureStore::new(pool))
    }

    fn record(scope: &str) -> SignatureRecord {
        let signature = KeyGenerator::default().generate().unwrap();
        SignatureRecord::issue(signature, scope.to_string(), 1, true, None, Utc::now()).unwrap()
    }

    async fn cleanup(store: &PgSignatureStore, signatures: &[&str]) {
        for signature in signatures {
            let _ = sqlx::query("DELETE FROM signatures WHERE signature = $1")
                .bind(signature)
                .execute(store.pool())
                .await;
        }
    }

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let Some(store) = test_store().await else {
            return;
        };
        let record = record("test");

        let inserted = store.insert(record.clone()).await.expect("insert");
        let found = store
            .find_by_signature(&record.signature)
            .await
            .expect("find")
            .expect("record exists");

        assert_eq!(inserted.id, record.id);
        assert_eq!(found.signature, record.signature);
        assert_eq!(found.scope, "test");
        assert_eq!(found.expiration_hours, 1);
        assert!(found.active);

        cleanup(&store, &[&record.signature]).await;
    }

    #[tokio::test]
    async fn insert_duplicate_signature_is_rejected() {
        let Some(store) = test_store().await else {
            return;
        };
        let first = record("test");
        let mut second = record("test");
        second.signature = first.signature.clone();

        store.insert(first.clone()).await.expect("insert first");
        let error = store
            .insert(second)
            .await
            .expect_err("duplicate insert should fail");
        assert!(matches!(error, SigningError::DuplicateSignature));

        cleanup(&store, &[&first.signature]).await;
    }

    #[tokio::test]
    async fn modify_serializes_concurrent_updates() {
        let Some(store) = test_store().await else {
            return;
        };
        let record = record("test");
        store.insert(record.clone()).await.expect("insert");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let signature = record.signature.clone();
            handles.push(tokio::spawn(async move {
                let mutation: RecordMutation = Box::new(|record: &mut SignatureRecord| {
                    record.rate_limit_calls += 1;
                    Ok(())
                });
                store.modify(&signature, mutation).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("modify");
        }

        let stored = store
            .find_by_signature(&record.signature)
            .await
            .expect("find")
            .expect("record exists");
        assert_eq!(stored.rate_limit_calls, 10);

        cleanup(&store, &[&record.signature]).await;
    }

    #[tokio::test]
    async fn replace_is_atomic() {
        let Some(store) = test_store().await else {
            return;
        };
        let old = record("test");
        store.insert(old.clone()).await.expect("insert");
        let successor = record("test");
        let successor_signature = successor.signature.clone();

        let rotation: RecordRotation = Box::new(move |old: &mut SignatureRecord| {
            old.active = false;
            old.rotated = true;
            let mut next = successor.clone();
            next.previous_signature = Some(old.signature.clone());
            Ok(next)
        });
        let inserted = store.replace(&old.signature, rotation).await.expect("replace");
        assert_eq!(inserted.previous_signature.as_deref(), Some(old.signature.as_str()));

        let previous = store
            .find_by_signature(&old.signature)
            .await
            .expect("find")
            .expect("old record exists");
        assert!(!previous.active);
        assert!(previous.rotated);

        cleanup(&store, &[&successor_signature, &old.signature]).await;
    }

    #[tokio::test]
    async fn list_all_applies_filter() {
        let Some(store) = test_store().await else {
            return;
        };
        let scope = format!("scope-{}", uuid::Uuid::new_v4());
        let active = record(&scope);
        let mut inactive = record(&scope);
        inactive.active = false;
        store.insert(active.clone()).await.expect("insert active");
        store.insert(inactive.clone()).await.expect("insert inactive");

        let all = store
            .list_all(&SignatureFilter::default().with_scope(scope.clone()))
            .await
            .expect("list");
        assert_eq!(all.len(), 2);

        let active_only = store
            .list_all(&SignatureFilter::active_only().with_scope(scope.clone()))
            .await
            .expect("list active");
        assert_eq!(active_only.len(), 1);
        assert_eq!(active_only[0].signature, active.signature);

        let expiring = store
            .list_all(
                &SignatureFilter::default()
                    .with_scope(scope)
                    .expiring_before(Utc::now() + Duration::hours(2)),
            )
            .await
            .expect("list expiring");
        assert_eq!(expiring.len(), 2);

        cleanup(&store, &[&active.signature, &inactive.signature]).await;
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let Some(store) = test_store().await else {
            return;
        };
        let record = record("test");
        store.insert(record.clone()).await.expect("insert");

        assert!(store.delete(&record.signature).await.expect("delete"));
        assert!(!store.delete(&record.signature).await.expect("delete again"));
        assert!(
            store
                .find_by_signature(&record.signature)
                .await
                .expect("find")
                .is_none()
        );
    }
}
