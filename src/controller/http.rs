//! HTTP handler exposing per-component debug endpoints.
//!
//! The controller does not bind a listener; the host application mounts the
//! returned router wherever it serves its own API.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tower::ServiceExt;

use super::graph::NodeId;
use super::Controller;

/// Builds the `/component/{id}/...` multiplexer.
pub(crate) fn component_handler(controller: Controller) -> Router {
    Router::new()
        .route("/component/{id}", get(component_info))
        .route("/component/{id}/{*rest}", any(component_extra))
        .with_state(controller)
}

async fn component_info(
    State(controller): State<Controller>,
    Path(id): Path<String>,
) -> Response {
    match controller.component_info(&NodeId::new(id)) {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, "component does not exist").into_response(),
    }
}

/// Forwards `/component/{id}/{rest}` to the component's own handler, with
/// the path rebased to `/{rest}`.
async fn component_extra(
    State(controller): State<Controller>,
    Path((id, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    let Some(node) = controller.get_node(&NodeId::new(id)) else {
        return (StatusCode::NOT_FOUND, "component does not exist").into_response();
    };
    let Some(handler) = node.http_handler() else {
        return (
            StatusCode::NOT_FOUND,
            "component does not expose a debug handler",
        )
            .into_response();
    };

    let (mut parts, body) = request.into_parts();
    let rebased = match rebase_uri(&parts.uri, &rest) {
        Some(uri) => uri,
        None => return (StatusCode::BAD_REQUEST, "invalid path").into_response(),
    };
    parts.uri = rebased;
    match handler.oneshot(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        // The error type of Router is Infallible.
        Err(never) => match never {},
    }
}

fn rebase_uri(uri: &Uri, rest: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("/{rest}?{query}"),
        None => format!("/{rest}"),
    };
    path_and_query.parse().ok()
}
