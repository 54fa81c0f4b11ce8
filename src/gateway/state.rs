use std::sync::Arc;

use crate::account::AccountService;
use crate::auth::TokenService;
use crate::booking::BookingService;
use crate::config::PresenceConfig;
use crate::conversations::ConversationService;
use crate::db::Database;
use crate::env::Environment;
use crate::ledger::LedgerService;
use crate::notifications::NotificationService;
use crate::payments::PaymentService;
use crate::presence::PresenceHub;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    pub env: Environment,
    pub tokens: Arc<TokenService>,
    pub accounts: Arc<AccountService>,
    pub ledger: Arc<LedgerService>,
    pub payments: Arc<PaymentService>,
    pub bookings: Arc<BookingService>,
    pub notifications: Arc<NotificationService>,
    pub conversations: Arc<ConversationService>,
    pub hub: Arc<PresenceHub>,
    pub presence: PresenceConfig,
    /// Absent in tests; health reports the pool when present
    pub db: Option<Arc<Database>>,
}
