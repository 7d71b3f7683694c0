//! Durable write HTTP Routes
//!
//! - `GET /`, `POST /` record a page view and answer with the visit count
//! - `POST /write` runs an arbitrary [`WriteRequest`] (opt-in)
//!
//! Every response is sent only after remote storage confirmed the write.
//! Failures map through [`WriteError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::state::GatewayState;
use crate::gateway::{record_visit, WriteError, WriteReceipt, WriteRequest};
use crate::replication::Position;

pub const PRE_POSITION_HEADER: HeaderName = HeaderName::from_static("x-walgate-pre-position");
pub const POST_POSITION_HEADER: HeaderName = HeaderName::from_static("x-walgate-post-position");
pub const SHIP_MS_HEADER: HeaderName = HeaderName::from_static("x-walgate-ship-ms");

/// Page-view routes at the root
pub fn page_view_routes(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(page_view_handler).post(page_view_handler))
        .with_state(state)
}

/// Generic SQL write route
pub fn sql_routes(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/write", post(write_handler))
        .with_state(state)
}

async fn page_view_handler(State(state): State<Arc<GatewayState>>) -> Result<Response, WriteError> {
    let ctx = state.request_context();
    let visit = record_visit(state.gateway().coordinator(), &ctx).await?;
    let headers = receipt_headers(&visit.receipt);
    Ok((StatusCode::OK, headers, visit.message()).into_response())
}

async fn write_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<WriteRequest>,
) -> Result<Response, WriteError> {
    let ctx = state.request_context();
    let receipt = state.gateway().coordinator().execute(&ctx, request).await?;
    let headers = receipt_headers(&receipt);
    Ok((StatusCode::OK, headers, Json(receipt)).into_response())
}

fn receipt_headers(receipt: &WriteReceipt) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, PRE_POSITION_HEADER, position_value(receipt.pre_position));
    insert(
        &mut headers,
        POST_POSITION_HEADER,
        receipt.post_position.to_string(),
    );
    insert(&mut headers, SHIP_MS_HEADER, receipt.ship_ms.to_string());
    headers
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn position_value(position: Option<Position>) -> String {
    position
        .map(|p| p.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Generation;

    #[test]
    fn test_receipt_headers() {
        let post = Position::new(Generation::new(), 1, 4152);
        let receipt = WriteReceipt {
            reads: Vec::new(),
            pre_position: None,
            post_position: post,
            confirmed: post,
            ship_ms: 12,
        };

        let headers = receipt_headers(&receipt);
        assert_eq!(headers[&PRE_POSITION_HEADER], "none");
        assert_eq!(headers[&POST_POSITION_HEADER], post.to_string().as_str());
        assert_eq!(headers[&SHIP_MS_HEADER], "12");
    }
}
