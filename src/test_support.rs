//! Wiring for service tests: every service over one [`MemoryStore`],
//! a manual clock and the mock gateway/push providers.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::account::{AccountService, PricingMode};
use crate::auth::TokenService;
use crate::booking::BookingService;
use crate::config::{JwtConfig, PresenceConfig};
use crate::conversations::ConversationService;
use crate::core_types::{AddressId, ServiceId, UserId};
use crate::env::{Environment, ManualClock};
use crate::gateway::state::AppState;
use crate::ledger::LedgerService;
use crate::memory_store::MemoryStore;
use crate::notifications::push::mock::MockPush;
use crate::notifications::{DispatcherConfig, NotificationService, PushDispatcher};
use crate::payment_gateway::mock::MockGateway;
use crate::payments::{PaymentService, SubscriptionActivator};
use crate::presence::PresenceHub;
use crate::settings::{BookingSettings, RuntimeSettings};

/// Monday 09:15 business time (UTC+05:30)
pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 3, 45, 0).unwrap()
}

pub fn test_env() -> (Environment, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(test_start()));
    let settings = Arc::new(RuntimeSettings::fixed(BookingSettings::default()));
    (Environment::new(clock.clone(), settings), clock)
}

pub struct TestWorld {
    pub store: Arc<MemoryStore>,
    pub env: Environment,
    pub clock: Arc<ManualClock>,
    pub hub: Arc<PresenceHub>,
    pub push: Arc<MockPush>,
    pub notifications: Arc<NotificationService>,
    pub accounts: Arc<AccountService>,
    pub gateway: Arc<MockGateway>,
    pub ledger: Arc<LedgerService>,
    pub payments: Arc<PaymentService>,
    pub bookings: Arc<BookingService>,
    pub conversations: Arc<ConversationService>,
    next_user: AtomicI64,
}

impl TestWorld {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let (env, clock) = test_env();
        let hub = Arc::new(PresenceHub::new(64));
        let push = Arc::new(MockPush::new());
        let dispatcher = Arc::new(PushDispatcher::new(
            env.clone(),
            store.clone(),
            push.clone(),
            DispatcherConfig::default(),
        ));
        let notifications = Arc::new(NotificationService::new(
            env.clone(),
            store.clone(),
            hub.clone(),
            dispatcher,
        ));
        let accounts = Arc::new(AccountService::new(env.clone(), store.clone()));
        let gateway = Arc::new(MockGateway::new());
        let ledger = Arc::new(LedgerService::new(env.clone(), store.clone()));
        let payments = Arc::new(PaymentService::new(
            env.clone(),
            store.clone(),
            gateway.clone(),
            accounts.clone(),
            notifications.clone(),
        ));
        payments.add_listener(Arc::new(SubscriptionActivator::new(accounts.clone())));
        let bookings = BookingService::new(
            env.clone(),
            store.clone(),
            accounts.clone(),
            payments.clone(),
            notifications.clone(),
        );
        let conversations = Arc::new(ConversationService::new(
            env.clone(),
            store.clone(),
            accounts.clone(),
            notifications.clone(),
        ));

        Self {
            store,
            env,
            clock,
            hub,
            push,
            notifications,
            accounts,
            gateway,
            ledger,
            payments,
            bookings,
            conversations,
            next_user: AtomicI64::new(1),
        }
    }

    fn next_user(&self) -> UserId {
        self.next_user.fetch_add(1, Ordering::SeqCst)
    }

    pub fn customer(&self) -> UserId {
        let id = self.next_user();
        self.store.add_customer(id);
        id
    }

    pub fn worker(&self) -> UserId {
        let id = self.next_user();
        self.store.add_worker(id);
        id
    }

    pub fn admin(&self) -> UserId {
        let id = self.next_user();
        self.store.add_admin(id);
        id
    }

    pub fn now(&self) -> DateTime<Utc> {
        use crate::env::Clock;
        self.clock.now()
    }

    pub async fn fund(&self, user_id: UserId, amount: Decimal) {
        self.ledger.credit(user_id, amount, None).await.unwrap();
    }

    pub fn address(&self, customer_id: UserId) -> AddressId {
        self.store.add_address(customer_id)
    }

    pub fn fixed_service(&self, price: Decimal, duration_minutes: i64) -> ServiceId {
        self.store
            .add_service(PricingMode::Fixed, Some(price), Some(duration_minutes))
    }

    pub fn inquiry_service(&self) -> ServiceId {
        self.store.add_service(PricingMode::Inquiry, None, None)
    }

    pub fn plan(&self, price: Decimal, duration_days: i64) -> i64 {
        self.store.add_plan(price, duration_days)
    }

    pub fn app_state(&self) -> Arc<AppState> {
        let jwt = JwtConfig {
            secret: "test-secret-0123456789".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 7,
        };
        Arc::new(AppState {
            env: self.env.clone(),
            tokens: Arc::new(TokenService::new(
                self.env.clone(),
                self.accounts.clone(),
                &jwt,
            )),
            accounts: self.accounts.clone(),
            ledger: self.ledger.clone(),
            payments: self.payments.clone(),
            bookings: self.bookings.clone(),
            notifications: self.notifications.clone(),
            conversations: self.conversations.clone(),
            hub: self.hub.clone(),
            presence: PresenceConfig::default(),
            db: None,
        })
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}
