//! Notification and device token persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::types::{DeviceToken, ListQuery, NewNotification, Notification};
use crate::core_types::{NotificationId, UserId};
use crate::error::CoreResult;

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, n: NewNotification, now: DateTime<Utc>) -> CoreResult<Notification>;

    async fn get(&self, id: NotificationId) -> CoreResult<Option<Notification>>;

    /// Sets `read_at` if unset. Ownership is checked by the caller.
    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()>;

    /// Returns the number of rows changed.
    async fn mark_all_read(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<u64>;

    async fn mark_delivered(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()>;

    async fn unread_count(&self, user_id: UserId) -> CoreResult<i64>;

    /// Newest first.
    async fn list(&self, user_id: UserId, query: ListQuery) -> CoreResult<Vec<Notification>>;

    /// Active tokens only.
    async fn device_tokens(&self, user_id: UserId) -> CoreResult<Vec<DeviceToken>>;

    /// Upsert on token; re-registering re-activates it.
    async fn register_device(
        &self,
        user_id: UserId,
        token: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<DeviceToken>;

    async fn disable_device_token(&self, token: &str, now: DateTime<Utc>) -> CoreResult<()>;
}

pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, body, data, delivered_at, read_at, created_at";

fn notification_from_row(row: &PgRow) -> Notification {
    Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: row.get("kind"),
        title: row.get("title"),
        body: row.get("body"),
        data: row.get("data"),
        delivered_at: row.get("delivered_at"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    }
}

fn token_from_row(row: &PgRow) -> DeviceToken {
    DeviceToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token: row.get("token"),
        platform: row.get("platform"),
        active: row.get("active"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, n: NewNotification, now: DateTime<Utc>) -> CoreResult<Notification> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO notifications_tb (user_id, kind, title, body, data, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {}"#,
            NOTIFICATION_COLUMNS
        ))
        .bind(n.user_id)
        .bind(&n.kind)
        .bind(&n.title)
        .bind(&n.body)
        .bind(&n.data)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(notification_from_row(&row))
    }

    async fn get(&self, id: NotificationId) -> CoreResult<Option<Notification>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM notifications_tb WHERE id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(notification_from_row))
    }

    async fn mark_read(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE notifications_tb SET read_at = $1 WHERE id = $2 AND read_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications_tb SET read_at = $1 WHERE user_id = $2 AND read_at IS NULL",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_delivered(&self, id: NotificationId, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE notifications_tb SET delivered_at = $1 WHERE id = $2 AND delivered_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unread_count(&self, user_id: UserId) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications_tb WHERE user_id = $1 AND read_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list(&self, user_id: UserId, query: ListQuery) -> CoreResult<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM notifications_tb
               WHERE user_id = $1
                 AND (NOT $2 OR read_at IS NULL)
                 AND ($3::bigint IS NULL OR id < $3)
               ORDER BY id DESC
               LIMIT $4"#,
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(query.unread_only)
        .bind(query.before_id)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    async fn device_tokens(&self, user_id: UserId) -> CoreResult<Vec<DeviceToken>> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, token, platform, active, updated_at
               FROM device_tokens_tb WHERE user_id = $1 AND active ORDER BY id"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(token_from_row).collect())
    }

    async fn register_device(
        &self,
        user_id: UserId,
        token: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<DeviceToken> {
        let row = sqlx::query(
            r#"INSERT INTO device_tokens_tb (user_id, token, platform, active, updated_at)
               VALUES ($1, $2, $3, TRUE, $4)
               ON CONFLICT (token) DO UPDATE
                   SET user_id = EXCLUDED.user_id,
                       platform = EXCLUDED.platform,
                       active = TRUE,
                       updated_at = EXCLUDED.updated_at
               RETURNING id, user_id, token, platform, active, updated_at"#,
        )
        .bind(user_id)
        .bind(token)
        .bind(platform)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(token_from_row(&row))
    }

    async fn disable_device_token(&self, token: &str, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE device_tokens_tb SET active = FALSE, updated_at = $1 WHERE token = $2")
            .bind(now)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
