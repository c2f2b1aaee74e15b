//! Postgres-backed presence flag.
//!
//! The users table belongs to the CRUD service; this process only flips the
//! `online` column and bumps `last_active`.

use async_trait::async_trait;
use proxychat_delivery::{DeliveryError, PresenceStore, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::{debug, info};

pub type DbPool = Pool<Postgres>;

const MAX_CONNECTIONS: u32 = 5;

pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await?;
    info!(max_connections = MAX_CONNECTIONS, "Connected to presence database");
    Ok(pool)
}

/// Presence flags in the `users` table.
#[derive(Clone)]
pub struct PgPresenceStore {
    pool: DbPool,
}

impl PgPresenceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(create_pool(database_url).await?))
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn set_online(&self, user_id: UserId, online: bool) -> proxychat_delivery::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET online = $1, last_active = NOW()
            WHERE id = $2
            "#,
        )
        .bind(online)
        .bind(user_id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| DeliveryError::presence(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(user_id = %user_id, "No users row to update presence for");
        }
        Ok(())
    }
}
