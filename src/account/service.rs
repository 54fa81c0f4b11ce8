//! Actor lookups and permission checks used by the core services.

use chrono::Duration;
use std::sync::Arc;

use super::db::AccountStore;
use super::models::{Actor, ActorKind, Service, UserSubscription};
use crate::core_types::{PaymentId, PlanId, ServiceId, UserId};
use crate::env::Environment;
use crate::error::{CoreError, CoreResult};

pub struct AccountService {
    env: Environment,
    store: Arc<dyn AccountStore>,
}

impl AccountService {
    pub fn new(env: Environment, store: Arc<dyn AccountStore>) -> Self {
        Self { env, store }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Active actor or `NotFound`.
    pub async fn actor(&self, user_id: UserId) -> CoreResult<Actor> {
        let actor = self
            .store
            .get_actor(user_id, self.env.now())
            .await?
            .ok_or_else(|| CoreError::not_found(format!("user {}", user_id)))?;
        if !actor.active {
            return Err(CoreError::forbidden(format!("user {} is inactive", user_id)));
        }
        Ok(actor)
    }

    /// Active actor of the given kind, `Forbidden` otherwise.
    pub async fn require_kind(&self, user_id: UserId, kind: ActorKind) -> CoreResult<Actor> {
        let actor = self.actor(user_id).await?;
        if actor.kind != kind {
            return Err(CoreError::forbidden(format!(
                "user {} is a {}, {} required",
                user_id, actor.kind, kind
            )));
        }
        Ok(actor)
    }

    pub async fn require_admin(&self, user_id: UserId) -> CoreResult<Actor> {
        self.require_kind(user_id, ActorKind::Admin).await
    }

    pub async fn admin_ids(&self) -> CoreResult<Vec<UserId>> {
        self.store.admin_ids().await
    }

    /// Active reference service or `NotFound`/`Validation`.
    pub async fn active_service(&self, service_id: ServiceId) -> CoreResult<Service> {
        let service = self
            .store
            .get_service(service_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("service {}", service_id)))?;
        if !service.active {
            return Err(CoreError::validation(format!("service {} is inactive", service_id)));
        }
        Ok(service)
    }

    /// Property/project listing is payment-gated: admins always may list,
    /// everyone else needs an active subscription.
    pub async fn require_listing_permission(&self, user_id: UserId) -> CoreResult<Actor> {
        let actor = self.actor(user_id).await?;
        if actor.is_admin() || actor.has_active_subscription {
            return Ok(actor);
        }
        Err(CoreError::forbidden(
            "an active subscription is required to publish listings",
        ))
    }

    /// Activate the plan bought by `payment_id`. Safe to call twice.
    pub async fn activate_subscription(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        payment_id: PaymentId,
    ) -> CoreResult<UserSubscription> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("subscription plan {}", plan_id)))?;
        let started_at = self.env.now();
        let expires_at = started_at + Duration::days(plan.duration_days);
        let sub = self
            .store
            .activate_subscription(user_id, plan_id, payment_id, started_at, expires_at)
            .await?;
        tracing::info!(
            user_id,
            plan_id,
            payment_id,
            expires_at = %sub.expires_at,
            "Subscription activated"
        );
        Ok(sub)
    }
}
