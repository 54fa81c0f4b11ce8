//! HTTP projection of the core services
//!
//! Thin axum router: every handler resolves the caller, delegates to one
//! service call and wraps the result in [`types::ApiResponse`].

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::auth::bearer_auth;
use crate::presence::ws_handler;
use handlers::{auth, bookings, conversations, notifications, payments};
use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/auth/refresh", post(auth::refresh_token))
        .route("/webhooks/payment", post(payments::payment_webhook))
        .route("/services/slots", get(bookings::available_slots));

    let booking_routes = Router::new()
        .route(
            "/",
            post(bookings::create_booking).get(bookings::list_bookings),
        )
        .route("/{id}", get(bookings::get_booking))
        .route("/{id}/events", get(bookings::booking_events))
        .route("/{id}/verify-payment", post(bookings::verify_booking_payment))
        .route("/{id}/cancel", post(bookings::cancel_booking))
        .route("/{id}/quote/accept", post(bookings::accept_quote))
        .route("/{id}/quote/reject", post(bookings::reject_quote))
        .route("/{id}/schedule", post(bookings::schedule_after_quote));

    let worker_routes = Router::new()
        .route("/assignments", get(bookings::list_assignments))
        .route("/assignments/{id}/accept", post(bookings::accept_assignment))
        .route("/assignments/{id}/reject", post(bookings::reject_assignment))
        .route("/assignments/{id}/start", post(bookings::start_work))
        .route("/assignments/{id}/complete", post(bookings::complete_work))
        .route("/withdrawals", post(payments::request_withdrawal));

    // Admin rights are checked by the services, not by the route.
    let admin_routes = Router::new()
        .route(
            "/bookings/{id}/awaiting-quote",
            post(bookings::mark_awaiting_quote),
        )
        .route(
            "/bookings/{id}/quote",
            post(bookings::provide_quote).put(bookings::update_quote),
        )
        .route("/bookings/{id}/assign", post(bookings::assign_worker))
        .route("/payments/{id}/refund", post(payments::refund_payment))
        .route("/wallet/adjust", post(payments::adjust_wallet))
        .route(
            "/withdrawals/{id}/approve",
            post(payments::approve_withdrawal),
        )
        .route("/withdrawals/{id}/reject", post(payments::reject_withdrawal));

    let payment_routes = Router::new()
        .route(
            "/",
            post(payments::create_order).get(payments::list_payments),
        )
        .route("/{id}", get(payments::get_payment))
        .route("/{id}/verify", post(payments::verify_order))
        .route("/{id}/cancel", post(payments::cancel_payment));

    let wallet_routes = Router::new()
        .route("/balance", get(payments::wallet_balance))
        .route("/history", get(payments::wallet_history))
        .route("/summary", get(payments::wallet_summary));

    let notification_routes = Router::new()
        .route("/", get(notifications::list_notifications))
        .route("/unread-count", get(notifications::unread_count))
        .route("/read-all", post(notifications::mark_all_read))
        .route("/{id}/read", post(notifications::mark_read))
        .route("/devices", put(notifications::register_device));

    let conversation_routes = Router::new()
        .route("/", post(conversations::open_conversation))
        .route(
            "/{id}/messages",
            post(conversations::send_message).get(conversations::history),
        )
        .route("/{id}/read", post(conversations::mark_read))
        .route("/{id}/close", post(conversations::close_conversation));

    let private_routes = Router::new()
        .nest("/bookings", booking_routes)
        .nest("/worker", worker_routes)
        .nest("/admin", admin_routes)
        .nest("/payments", payment_routes)
        .nest("/wallet", wallet_routes)
        .nest("/notifications", notification_routes)
        .nest("/conversations", conversation_routes)
        .layer(from_fn_with_state(state.tokens.clone(), bearer_auth));

    Router::new()
        // WebSocket authenticates with the token query parameter
        .route("/ws/{scope}", get(ws_handler))
        .nest("/api/v1", public_routes.merge(private_routes))
        .with_state(state)
}

/// Start HTTP Gateway server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Gateway listening");
    axum::serve(listener, app).await
}
