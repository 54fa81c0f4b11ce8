//! Notification service
//!
//! Persistence first, then best-effort delivery. Neither the push queue
//! nor the presence hub can fail a `create`.

use std::sync::Arc;

use super::db::NotificationStore;
use super::dispatcher::{PushDispatcher, PushJob};
use super::push::PushMessage;
use super::types::{DeviceToken, ListQuery, NewNotification, Notification};
use crate::core_types::{NotificationId, UserId};
use crate::env::Environment;
use crate::error::{CoreError, CoreResult};
use crate::presence::{ChannelEvent, PresenceHub, Scope};

pub struct NotificationService {
    env: Environment,
    store: Arc<dyn NotificationStore>,
    hub: Arc<PresenceHub>,
    dispatcher: Arc<PushDispatcher>,
}

impl NotificationService {
    pub fn new(
        env: Environment,
        store: Arc<dyn NotificationStore>,
        hub: Arc<PresenceHub>,
        dispatcher: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            env,
            store,
            hub,
            dispatcher,
        }
    }

    pub async fn create(&self, new: NewNotification) -> CoreResult<Notification> {
        if new.title.trim().is_empty() {
            return Err(CoreError::validation("notification title is required"));
        }
        let now = self.env.now();
        let notification = self.store.insert(new, now).await?;

        match self.store.device_tokens(notification.user_id).await {
            Ok(tokens) => {
                let message = PushMessage::from_parts(
                    &notification.title,
                    &notification.body,
                    &notification.data,
                );
                for t in tokens {
                    self.dispatcher.enqueue(PushJob {
                        notification_id: notification.id,
                        user_id: notification.user_id,
                        token: t.token,
                        message: message.clone(),
                        attempts: 0,
                        not_before: now,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(user_id = notification.user_id, error = %e, "Could not load device tokens, skipping push");
            }
        }

        match self.store.unread_count(notification.user_id).await {
            Ok(unread_count) => {
                self.hub.unicast(
                    notification.user_id,
                    ChannelEvent::NewNotification {
                        notification: notification.frame(),
                        unread_count,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(user_id = notification.user_id, error = %e, "Could not count unread, skipping live update");
            }
        }

        tracing::debug!(
            notification_id = notification.id,
            user_id = notification.user_id,
            kind = %notification.kind,
            "Notification created"
        );
        Ok(notification)
    }

    /// Fan-out helper; a failure for one recipient does not stop the rest.
    pub async fn create_many(&self, items: Vec<NewNotification>) -> usize {
        let mut created = 0;
        for item in items {
            let user_id = item.user_id;
            match self.create(item).await {
                Ok(_) => created += 1,
                Err(e) => tracing::error!(user_id, error = %e, "Failed to create notification"),
            }
        }
        created
    }

    /// Marks one of the caller's notifications read. Returns the new
    /// unread count.
    pub async fn mark_read(&self, user_id: UserId, id: NotificationId) -> CoreResult<i64> {
        let notification = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("notification {}", id)))?;
        if notification.user_id != user_id {
            return Err(CoreError::forbidden(format!(
                "notification {} belongs to another user",
                id
            )));
        }
        if !notification.is_read() {
            self.store.mark_read(id, self.env.now()).await?;
        }
        self.publish_unread(user_id).await
    }

    pub async fn mark_all_read(&self, user_id: UserId) -> CoreResult<i64> {
        let changed = self.store.mark_all_read(user_id, self.env.now()).await?;
        tracing::debug!(user_id, changed, "Marked all notifications read");
        self.publish_unread(user_id).await
    }

    pub async fn unread_count(&self, user_id: UserId) -> CoreResult<i64> {
        self.store.unread_count(user_id).await
    }

    pub async fn list(&self, user_id: UserId, query: ListQuery) -> CoreResult<Vec<Notification>> {
        if !(1..=200).contains(&query.limit) {
            return Err(CoreError::validation("limit must be within 1..=200"));
        }
        self.store.list(user_id, query).await
    }

    pub async fn register_device(
        &self,
        user_id: UserId,
        token: &str,
        platform: &str,
    ) -> CoreResult<DeviceToken> {
        if token.trim().is_empty() {
            return Err(CoreError::validation("device token is required"));
        }
        if !matches!(platform, "android" | "ios" | "web") {
            return Err(CoreError::validation(format!("unknown platform {:?}", platform)));
        }
        self.store
            .register_device(user_id, token.trim(), platform, self.env.now())
            .await
    }

    /// Admin console live feed.
    pub fn broadcast_admin(&self, event: ChannelEvent) -> usize {
        self.hub.broadcast(Scope::AdminNotifications, event)
    }

    async fn publish_unread(&self, user_id: UserId) -> CoreResult<i64> {
        let unread_count = self.store.unread_count(user_id).await?;
        self.hub
            .unicast(user_id, ChannelEvent::UnreadCountUpdate { unread_count });
        Ok(unread_count)
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    pub fn dispatcher(&self) -> &Arc<PushDispatcher> {
        &self.dispatcher
    }
}
