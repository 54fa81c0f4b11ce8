//! Account store: actors and the reference entities the core reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;

use super::models::{
    Actor, ActorKind, AddressSnapshot, PricingMode, Service, SubscriptionPlan, UserSubscription,
};
use crate::core_types::{AddressId, PaymentId, PlanId, ServiceId, UserId};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Actor with `has_active_subscription` derived at `now`.
    async fn get_actor(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<Option<Actor>>;

    /// IDs of all active admins (notification fan-out).
    async fn admin_ids(&self) -> CoreResult<Vec<UserId>>;

    async fn get_service(&self, service_id: ServiceId) -> CoreResult<Option<Service>>;

    async fn get_plan(&self, plan_id: PlanId) -> CoreResult<Option<SubscriptionPlan>>;

    /// Address owned by `customer_id`; `None` if absent or owned by someone else.
    async fn get_address(
        &self,
        customer_id: UserId,
        address_id: AddressId,
    ) -> CoreResult<Option<AddressSnapshot>>;

    /// Idempotent on `payment_id`: a second call returns the existing row.
    async fn activate_subscription(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        payment_id: PaymentId,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<UserSubscription>;
}

/// PostgreSQL implementation
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_kind(raw: &str) -> CoreResult<ActorKind> {
    ActorKind::from_str(raw).map_err(CoreError::Internal)
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get_actor(&self, user_id: UserId, now: DateTime<Utc>) -> CoreResult<Option<Actor>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.phone, a.email, a.kind, a.active, a.verified, a.wallet_balance,
                   EXISTS (SELECT 1 FROM user_subscriptions_tb s
                           WHERE s.user_id = a.id AND s.expires_at > $2) AS has_active_subscription
            FROM actors_tb a
            WHERE a.id = $1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Actor {
                id: r.get("id"),
                phone: r.get("phone"),
                email: r.get("email"),
                kind: parse_kind(r.get::<&str, _>("kind"))?,
                active: r.get("active"),
                verified: r.get("verified"),
                wallet_balance: r.get("wallet_balance"),
                has_active_subscription: r.get("has_active_subscription"),
            })
        })
        .transpose()
    }

    async fn admin_ids(&self) -> CoreResult<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM actors_tb WHERE kind = 'admin' AND active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_service(&self, service_id: ServiceId) -> CoreResult<Option<Service>> {
        let row = sqlx::query(
            r#"SELECT id, name, active, pricing_mode, price, duration_minutes,
                      category_id, subcategory_id
               FROM services_tb WHERE id = $1"#,
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Service {
                id: r.get("id"),
                name: r.get("name"),
                active: r.get("active"),
                pricing_mode: PricingMode::from_str(r.get::<&str, _>("pricing_mode"))
                    .map_err(CoreError::Internal)?,
                price: r.get("price"),
                duration_minutes: r.get::<Option<i32>, _>("duration_minutes").map(i64::from),
                category_id: r.get("category_id"),
                subcategory_id: r.get("subcategory_id"),
            })
        })
        .transpose()
    }

    async fn get_plan(&self, plan_id: PlanId) -> CoreResult<Option<SubscriptionPlan>> {
        let row = sqlx::query(
            "SELECT id, name, price, duration_days, active FROM subscription_plans_tb WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SubscriptionPlan {
            id: r.get("id"),
            name: r.get("name"),
            price: r.get("price"),
            duration_days: i64::from(r.get::<i32, _>("duration_days")),
            active: r.get("active"),
        }))
    }

    async fn get_address(
        &self,
        customer_id: UserId,
        address_id: AddressId,
    ) -> CoreResult<Option<AddressSnapshot>> {
        let row = sqlx::query(
            r#"SELECT id, label, line, city, state, postal_code, latitude, longitude
               FROM addresses_tb WHERE id = $1 AND user_id = $2"#,
        )
        .bind(address_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AddressSnapshot {
            address_id: r.get("id"),
            label: r.get("label"),
            line: r.get("line"),
            city: r.get("city"),
            state: r.get("state"),
            postal_code: r.get("postal_code"),
            latitude: r.get("latitude"),
            longitude: r.get("longitude"),
        }))
    }

    async fn activate_subscription(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        payment_id: PaymentId,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<UserSubscription> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_subscriptions_tb (plan_id, user_id, started_at, expires_at, payment_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (payment_id) DO UPDATE SET payment_id = EXCLUDED.payment_id
            RETURNING id, plan_id, user_id, started_at, expires_at, payment_id
            "#,
        )
        .bind(plan_id)
        .bind(user_id)
        .bind(started_at)
        .bind(expires_at)
        .bind(payment_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserSubscription {
            id: row.get("id"),
            plan_id: row.get("plan_id"),
            user_id: row.get("user_id"),
            started_at: row.get("started_at"),
            expires_at: row.get("expires_at"),
            payment_id: row.get("payment_id"),
        })
    }
}
