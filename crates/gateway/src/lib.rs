//! HTTP surface assembly: the inbound API router (behind [`auth::require_api_key`]) and the
//! agent WebSocket router, plus the shared [`AppState`] both depend on.

pub mod auth;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, header},
    middleware,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

pub use state::AppState;
pub use ws::agent_router;

/// Builds the inbound API router: dialect routes behind the API-key gate, wrapped in the
/// same middleware stack shape the teacher applies to its own gateway (panic catching,
/// sensitive-header redaction, request-id propagation, tracing, CORS).
///
/// Unlike the teacher's browser-facing CSWSH-aware CORS policy, every caller here already
/// proves possession of an API key, so `allow_origin(Any)` carries no additional risk and
/// keeps local tooling (curl, SDKs with a browser-embedded fetch) working without configuration.
pub fn router(state: Arc<AppState>) -> Router {
    let api = routes::router()
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    let router = Router::new().merge(api).with_state(state);

    router
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetSensitiveRequestHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        .layer(CatchPanicLayer::new())
}
