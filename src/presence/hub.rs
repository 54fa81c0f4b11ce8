//! Presence hub
//!
//! Registry of live channels, indexed by actor and by scope. Every channel
//! owns a bounded outbound queue drained by its writer task; a channel whose
//! queue is full is dropped and unregistered instead of slowing the sender.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::events::ChannelEvent;
use crate::core_types::{ConversationId, UserId};

pub type ChannelId = u64;

/// What a channel subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    UserNotifications(UserId),
    AdminNotifications,
    Conversation(ConversationId),
    UserMonitor,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::UserNotifications(id) => write!(f, "user_notifications:{}", id),
            Scope::AdminNotifications => write!(f, "admin_notifications"),
            Scope::Conversation(id) => write!(f, "conversation:{}", id),
            Scope::UserMonitor => write!(f, "user_monitor"),
        }
    }
}

struct ChannelEntry {
    actor: UserId,
    scope: Scope,
    tx: mpsc::Sender<ChannelEvent>,
}

/// Handed to the connection owner on register.
pub struct Registration {
    pub id: ChannelId,
    pub rx: mpsc::Receiver<ChannelEvent>,
}

pub struct PresenceHub {
    channels: DashMap<ChannelId, ChannelEntry>,
    by_actor: DashMap<UserId, Vec<ChannelId>>,
    by_scope: DashMap<Scope, Vec<ChannelId>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl PresenceHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            by_actor: DashMap::new(),
            by_scope: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self, actor: UserId, scope: Scope) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        self.channels.insert(id, ChannelEntry { actor, scope, tx });
        self.by_scope.entry(scope).or_default().push(id);
        let actor_channels = {
            let mut ids = self.by_actor.entry(actor).or_default();
            ids.push(id);
            ids.len()
        };

        tracing::info!(actor, channel_id = id, %scope, actor_channels, "Channel registered");

        if actor_channels == 1 && scope != Scope::UserMonitor {
            self.broadcast(
                Scope::UserMonitor,
                ChannelEvent::Presence {
                    user_id: actor,
                    online: true,
                },
            );
        }
        Registration { id, rx }
    }

    /// Remove a channel. Dropping its sender ends the writer task.
    /// Unknown ids are ignored.
    pub fn unregister(&self, id: ChannelId) {
        let Some((_, entry)) = self.channels.remove(&id) else {
            return;
        };

        if let Some(mut ids) = self.by_scope.get_mut(&entry.scope) {
            ids.retain(|c| *c != id);
        }
        self.by_scope.remove_if(&entry.scope, |_, ids| ids.is_empty());

        let actor_remaining = match self.by_actor.get_mut(&entry.actor) {
            Some(mut ids) => {
                ids.retain(|c| *c != id);
                ids.len()
            }
            None => 0,
        };
        self.by_actor.remove_if(&entry.actor, |_, ids| ids.is_empty());

        tracing::info!(actor = entry.actor, channel_id = id, scope = %entry.scope, actor_remaining, "Channel unregistered");

        if actor_remaining == 0 && entry.scope != Scope::UserMonitor {
            self.broadcast(
                Scope::UserMonitor,
                ChannelEvent::Presence {
                    user_id: entry.actor,
                    online: false,
                },
            );
        }
    }

    /// Fan out to every channel in `scope`. Returns the number of channels
    /// that accepted the event.
    pub fn broadcast(&self, scope: Scope, event: ChannelEvent) -> usize {
        let ids = self
            .by_scope
            .get(&scope)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        self.deliver(&ids, event)
    }

    /// Send to every channel of `actor`, whatever its scope.
    pub fn unicast(&self, actor: UserId, event: ChannelEvent) -> usize {
        let ids = self
            .by_actor
            .get(&actor)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        self.deliver(&ids, event)
    }

    /// Send to one channel (replies such as pong).
    pub fn send_to(&self, id: ChannelId, event: ChannelEvent) -> bool {
        self.deliver(&[id], event) == 1
    }

    /// Close every channel of `scope`.
    pub fn close_scope(&self, scope: Scope) -> usize {
        let ids = self
            .by_scope
            .remove(&scope)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &ids {
            self.unregister(*id);
        }
        if !ids.is_empty() {
            tracing::info!(%scope, closed = ids.len(), "Scope closed");
        }
        ids.len()
    }

    fn deliver(&self, ids: &[ChannelId], event: ChannelEvent) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for id in ids {
            let Some(tx) = self.channels.get(id).map(|c| c.tx.clone()) else {
                continue;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(channel_id = id, event = event.type_name(), "Outbound queue full, dropping slow channel");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            self.unregister(id);
        }
        delivered
    }

    pub fn is_online(&self, actor: UserId) -> bool {
        self.by_actor.contains_key(&actor)
    }

    pub fn actor_channel_count(&self, actor: UserId) -> usize {
        self.by_actor.get(&actor).map(|ids| ids.len()).unwrap_or(0)
    }

    /// (online actors, open channels)
    pub fn stats(&self) -> (usize, usize) {
        (self.by_actor.len(), self.channels.len())
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let hub = PresenceHub::new(8);
        let a = hub.register(1001, Scope::UserNotifications(1001));
        let b = hub.register(1001, Scope::UserNotifications(1001));
        assert_eq!(hub.stats(), (1, 2));
        assert!(hub.is_online(1001));

        hub.unregister(a.id);
        assert_eq!(hub.actor_channel_count(1001), 1);
        hub.unregister(b.id);
        hub.unregister(b.id);
        assert_eq!(hub.stats(), (0, 0));
    }

    #[test]
    fn test_unicast_reaches_every_channel_of_actor() {
        let hub = PresenceHub::new(8);
        let mut web = hub.register(1, Scope::UserNotifications(1));
        let mut mobile = hub.register(1, Scope::UserNotifications(1));
        let mut other = hub.register(2, Scope::UserNotifications(2));

        let sent = hub.unicast(1, ChannelEvent::UnreadCountUpdate { unread_count: 2 });
        assert_eq!(sent, 2);
        assert_eq!(
            web.rx.try_recv().unwrap(),
            ChannelEvent::UnreadCountUpdate { unread_count: 2 }
        );
        assert!(mobile.rx.try_recv().is_ok());
        assert!(other.rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_slow_channel() {
        let hub = PresenceHub::new(1);
        let mut slow = hub.register(1, Scope::Conversation(5));
        let mut fast = hub.register(2, Scope::Conversation(5));

        assert_eq!(hub.broadcast(Scope::Conversation(5), ChannelEvent::Pong), 2);
        assert!(fast.rx.try_recv().is_ok());

        assert_eq!(hub.broadcast(Scope::Conversation(5), ChannelEvent::Pong), 1);
        assert!(!hub.is_online(1));
        assert!(hub.is_online(2));

        // slow channel got its first frame, then its sender was dropped
        assert!(slow.rx.try_recv().is_ok());
        assert!(matches!(
            slow.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_close_scope_closes_channels() {
        let hub = PresenceHub::new(4);
        let mut a = hub.register(1, Scope::Conversation(9));
        let _b = hub.register(2, Scope::Conversation(9));
        let _c = hub.register(3, Scope::UserNotifications(3));

        assert_eq!(hub.close_scope(Scope::Conversation(9)), 2);
        assert_eq!(hub.broadcast(Scope::Conversation(9), ChannelEvent::Pong), 0);
        assert!(matches!(
            a.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(hub.stats(), (1, 1));
    }

    #[test]
    fn test_monitor_sees_presence_changes() {
        let hub = PresenceHub::new(4);
        let mut monitor = hub.register(99, Scope::UserMonitor);
        let user = hub.register(7, Scope::UserNotifications(7));
        assert_eq!(
            monitor.rx.try_recv().unwrap(),
            ChannelEvent::Presence {
                user_id: 7,
                online: true
            }
        );
        hub.unregister(user.id);
        assert_eq!(
            monitor.rx.try_recv().unwrap(),
            ChannelEvent::Presence {
                user_id: 7,
                online: false
            }
        );
    }
}
