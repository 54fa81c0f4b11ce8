//! TreesIndia marketplace core - server entry point
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────────┐
//! │  Config  │───▶│  Postgres  │───▶│   Services   │───▶ HTTP + WebSocket
//! │  (YAML)  │    │ (migrate)  │    │ (core logic) │───▶ Scheduler
//! └──────────┘    └────────────┘    └──────────────┘───▶ Push dispatcher
//! ```

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use treesindia::account::{AccountService, PgAccountStore};
use treesindia::auth::TokenService;
use treesindia::booking::{BookingService, PgBookingStore};
use treesindia::config::AppConfig;
use treesindia::conversations::{ConversationService, PgConversationStore};
use treesindia::db::Database;
use treesindia::env::{Environment, SystemClock};
use treesindia::gateway::{run_server, state::AppState};
use treesindia::ledger::{LedgerService, PgLedgerStore};
use treesindia::notifications::{
    DispatcherConfig, FcmClient, NotificationService, PgNotificationStore, PushDispatcher,
};
use treesindia::payment_gateway::RazorpayClient;
use treesindia::payments::{PaymentService, PgPaymentStore, SubscriptionActivator};
use treesindia::presence::PresenceHub;
use treesindia::scheduler::{
    ExpireHoldsJob, ExpireQuotesJob, PgJobLock, ReconcileBalancesJob, ReconcilePendingPaymentsJob,
    Scheduler, SchedulerConfig, WithdrawalRemindersJob,
};
use treesindia::settings::{PgSettingsStore, RuntimeSettings};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_name = get_env();
    let app_config = AppConfig::load(&env_name).context("loading configuration")?;
    let _log_guard = treesindia::logging::init_logging(&app_config);

    tracing::info!(env = %env_name, git_hash = env!("GIT_HASH"), "Starting TreesIndia core");

    // [1] Storage
    let db = Arc::new(
        Database::connect(&app_config.postgres_url, app_config.postgres_max_connections)
            .await
            .context("connecting to PostgreSQL")?,
    );
    db.migrate().await.context("applying migrations")?;
    let pool = db.pool().clone();

    // [2] Environment
    let settings = Arc::new(RuntimeSettings::new(
        Arc::new(PgSettingsStore::new(pool.clone())),
        Duration::from_secs(app_config.settings_ttl_secs),
    ));
    settings.reload().await;
    let env = Environment::new(Arc::new(SystemClock), settings);

    // [3] Providers
    let gateway = Arc::new(
        RazorpayClient::new(app_config.payment_gateway.clone())
            .context("building payment gateway client")?,
    );
    let push = Arc::new(FcmClient::new(app_config.push.fcm.clone()).context("building push client")?);

    // [4] Services
    let notification_store = Arc::new(PgNotificationStore::new(pool.clone()));
    let hub = Arc::new(PresenceHub::new(app_config.presence.outbound_queue));
    let dispatcher = Arc::new(PushDispatcher::new(
        env.clone(),
        notification_store.clone(),
        push,
        DispatcherConfig {
            queue_capacity: app_config.push.queue_size,
            ..DispatcherConfig::default()
        },
    ));
    let notifications = Arc::new(NotificationService::new(
        env.clone(),
        notification_store,
        hub.clone(),
        dispatcher.clone(),
    ));
    let accounts = Arc::new(AccountService::new(
        env.clone(),
        Arc::new(PgAccountStore::new(pool.clone())),
    ));
    let ledger = Arc::new(LedgerService::new(
        env.clone(),
        Arc::new(PgLedgerStore::new(pool.clone())),
    ));
    let payments = Arc::new(PaymentService::new(
        env.clone(),
        Arc::new(PgPaymentStore::new(pool.clone())),
        gateway,
        accounts.clone(),
        notifications.clone(),
    ));
    payments.add_listener(Arc::new(SubscriptionActivator::new(accounts.clone())));
    let bookings = BookingService::new(
        env.clone(),
        Arc::new(PgBookingStore::new(pool.clone())),
        accounts.clone(),
        payments.clone(),
        notifications.clone(),
    );
    let conversations = Arc::new(ConversationService::new(
        env.clone(),
        Arc::new(PgConversationStore::new(pool.clone())),
        accounts.clone(),
        notifications.clone(),
    ));
    let tokens = Arc::new(TokenService::new(
        env.clone(),
        accounts.clone(),
        &app_config.jwt,
    ));

    // [5] Background loops
    tokio::spawn(async move {
        dispatcher.run().await;
    });

    if app_config.scheduler.enabled {
        let mut scheduler = Scheduler::new(
            env.clone(),
            Arc::new(PgJobLock::new(pool.clone())),
            SchedulerConfig {
                tick: Duration::from_millis(app_config.scheduler.tick_ms),
            },
        );
        scheduler.register(Arc::new(ExpireHoldsJob::new(bookings.clone())));
        scheduler.register(Arc::new(ExpireQuotesJob::new(bookings.clone())));
        scheduler.register(Arc::new(WithdrawalRemindersJob::new(payments.clone())));
        scheduler.register(Arc::new(ReconcilePendingPaymentsJob::new(payments.clone())));
        scheduler.register(Arc::new(ReconcileBalancesJob::new(ledger.clone())));
        tokio::spawn(async move {
            scheduler.run().await;
        });
    } else {
        tracing::warn!("Scheduler disabled by configuration");
    }

    // [6] HTTP + WebSocket
    let state = Arc::new(AppState {
        env,
        tokens,
        accounts,
        ledger,
        payments,
        bookings,
        notifications,
        conversations,
        hub,
        presence: app_config.presence.clone(),
        db: Some(db),
    });
    let port = get_port_override().unwrap_or(app_config.gateway.port);
    run_server(&app_config.gateway.host, port, state)
        .await
        .context("gateway server")?;
    Ok(())
}
