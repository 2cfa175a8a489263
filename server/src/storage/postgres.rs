use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::KeyValueStore;

/// Postgres backed store over the `oauth_kv` table
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ttl_secs(ttl: Option<Duration>) -> Option<f64> {
    ttl.map(|ttl| ttl.as_secs_f64())
}

#[async_trait::async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM oauth_kv
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to read oauth_kv")?;

        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .wrap_err("Failed to decode oauth_kv value")
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> color_eyre::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_kv (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3::float8))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .wrap_err("Failed to write oauth_kv")?;

        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> color_eyre::Result<bool> {
        // An expired row counts as absent and is overwritten in place.
        let result = sqlx::query(
            r#"
            INSERT INTO oauth_kv (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3::float8))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                created_at = now(),
                updated_at = now()
            WHERE oauth_kv.expires_at IS NOT NULL AND oauth_kv.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .wrap_err("Failed to insert into oauth_kv")?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> color_eyre::Result<bool> {
        let result = sqlx::query("DELETE FROM oauth_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to delete from oauth_kv")?;

        Ok(result.rows_affected() > 0)
    }

    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let row = sqlx::query(
            r#"
            DELETE FROM oauth_kv WHERE key = $1
            RETURNING value, (expires_at IS NULL OR expires_at > now()) AS live
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to take from oauth_kv")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let live: bool = row.try_get("live").wrap_err("Failed to decode liveness")?;
        if !live {
            return Ok(None);
        }

        Ok(Some(row.try_get("value").wrap_err("Failed to decode oauth_kv value")?))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> color_eyre::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_kv SET value = $3, updated_at = now()
            WHERE key = $1 AND value = $2
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(new)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to swap oauth_kv value")?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self) -> color_eyre::Result<u64> {
        let result =
            sqlx::query("DELETE FROM oauth_kv WHERE expires_at IS NOT NULL AND expires_at <= now()")
                .execute(&self.pool)
                .await
                .wrap_err("Failed to purge oauth_kv")?;

        Ok(result.rows_affected())
    }
}

/// Serializes migrations across instances starting at the same time
const MIGRATION_LOCK_ID: i64 = 0xDB_DB_DB_DB_DB_DB_DB;

#[tracing::instrument(err, skip(database_url))]
pub async fn setup_db_pool(database_url: &str) -> color_eyre::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to DATABASE_URL")?;

    // Advisory locks belong to a session, so lock, migrate and unlock on one connection.
    let mut conn = pool
        .acquire()
        .await
        .wrap_err("Failed to acquire migration connection")?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(&mut *conn)
        .await
        .wrap_err("Failed to take migration lock")?;

    let migrated = sqlx::migrate!("../migrations").run(&mut *conn).await;

    let unlocked: Option<bool> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_ID)
        .fetch_one(&mut *conn)
        .await
        .wrap_err("Failed to release migration lock")?;
    migrated.wrap_err("Failed to run migrations")?;

    match unlocked {
        Some(true) => tracing::info!("Migration lock unlocked"),
        Some(false) => tracing::warn!("Migration lock was not held"),
        None => return Err(eyre!("Failed to unlock migration lock")),
    }

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Postgres tests run only when `TEST_DATABASE_URL` points at a scratch database
    fn database_url() -> Option<String> {
        std::env::var("TEST_DATABASE_URL").ok()
    }

    #[tokio::test]
    async fn migration_lock_is_released_after_setup() {
        let Some(url) = database_url() else {
            return;
        };

        let (first, second) = tokio::join!(setup_db_pool(&url), setup_db_pool(&url));
        let (first, _second) = (first.unwrap(), second.unwrap());

        // Both pools are still alive, so a leaked lock would still be held by one of them.
        let other = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .fetch_one(&other)
            .await
            .unwrap();
        assert!(locked);
        let _: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .fetch_one(&other)
            .await
            .unwrap();

        let store = PgStore::new(first);
        store.put("test:pg:lock", "v1", None).await.unwrap();
        assert!(store.compare_and_swap("test:pg:lock", "v1", "v2").await.unwrap());
        assert_eq!(store.take("test:pg:lock").await.unwrap().as_deref(), Some("v2"));
    }
}
