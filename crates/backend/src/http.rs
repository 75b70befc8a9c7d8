//! The backend's web api.
//!
//! All distributor-facing endpoints require bearer authentication; the
//! status and metrics endpoints are public diagnostics.

use crate::{BackendConfig, Metrics};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rdsys_api::{
    RdError, RdResult, Registry, Resource, ResourceDiff, ResourceMap,
    ResourceRequest, ResourceState, SpeedState, TestState,
};
use rdsys_core::BackendResources;
use rdsys_resources::hash_fingerprint;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How many diffs may queue up per subscriber before further ones are
/// dropped for that subscriber.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Everything the request handlers need.
#[derive(Clone)]
pub struct AppState {
    /// The backend section of the configuration.
    pub config: Arc<BackendConfig>,
    /// The resource collection and subscriber registry.
    pub resources: Arc<BackendResources>,
    /// The resource type registry.
    pub registry: Arc<Registry>,
    /// The Prometheus metrics.
    pub metrics: Arc<Metrics>,
}

/// Build the backend's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/resources",
            get(get_resources).post(post_resources),
        )
        .route("/resource-stream", get(get_resource_stream))
        .route("/status", get(get_status))
        .route("/targets", get(get_targets))
        .route("/rdsys-backend-metrics", get(get_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Map an error onto the HTTP status code it stands for.
fn error_response(err: RdError) -> Response {
    let status = match &err {
        RdError::Unauthorized => StatusCode::UNAUTHORIZED,
        RdError::BadRequest(_) | RdError::NotImplemented(_) => {
            StatusCode::BAD_REQUEST
        }
        RdError::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// Authenticate the given request against the configured bearer tokens.
fn authenticate(
    config: &BackendConfig,
    headers: &HeaderMap,
) -> RdResult<()> {
    let token_line = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::info!(
                "Request carries no 'Authorization' HTTP header.",
            );
            RdError::bad_request(
                "request carries no 'Authorization' HTTP header",
            )
        })?;
    let token = token_line.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::info!("Authorization header contains no bearer token.");
        RdError::bad_request("authorization header contains no bearer token")
    })?;

    if config.api_tokens.values().any(|saved| saved == token) {
        Ok(())
    } else {
        tracing::info!("Invalid authentication token.");
        Err(RdError::Unauthorized)
    }
}

fn parse_resource_request(body: &[u8]) -> RdResult<ResourceRequest> {
    serde_json::from_slice(body).map_err(|err| {
        tracing::info!("Failed to unmarshal HTTP body: {err}");
        RdError::bad_request(err)
    })
}

/// The resources a distributor gets in its initial stream snapshot: the
/// working resources of every requested type.
fn working_resources(
    resources: &BackendResources,
    req: &ResourceRequest,
) -> ResourceMap {
    let mut map = ResourceMap::new();
    for rtype in &req.resource_types {
        let state = resources.get(&req.request_origin, rtype);
        map.0.insert(rtype.clone(), state.working);
    }
    map
}

async fn get_resources(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    state.metrics.inc_request("/resources");
    if let Err(err) = authenticate(&state.config, &headers) {
        return error_response(err);
    }
    let req = match parse_resource_request(&body) {
        Ok(req) => req,
        Err(err) => return error_response(err),
    };
    tracing::info!(
        "Distributor {:?} is asking for {:?}.",
        req.request_origin,
        req.resource_types,
    );

    let mut resource_state = ResourceState::default();
    for rtype in &req.resource_types {
        let mut s = state.resources.get(&req.request_origin, rtype);
        resource_state.working.append(&mut s.working);
        resource_state.not_working.append(&mut s.not_working);
    }
    tracing::info!(
        "Returning {} working and {} not working resources of type {:?} \
         to distributor {:?}.",
        resource_state.working.len(),
        resource_state.not_working.len(),
        req.resource_types,
        req.request_origin,
    );

    axum::Json(resource_state).into_response()
}

async fn post_resources(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    state.metrics.inc_request("/resources");
    if let Err(err) = authenticate(&state.config, &headers) {
        return error_response(err);
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::info!("Error unmarshalling raw resources: {err}");
            return error_response(RdError::bad_request(
                "failed to unmarshal raw resources",
            ));
        }
    };
    let resources = match state.registry.decode_list(&raw) {
        Ok(resources) => resources,
        Err(err) => {
            tracing::info!("Error unmarshalling resources: {err}");
            return error_response(err);
        }
    };

    for r in resources {
        tracing::info!("Added {:?} resource to collection.", r.resource_type());
        state.resources.add(r);
    }
    state.resources.collection().save();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response()
}

/// A resource diff and its `\r` delimiter, ready for the wire.
fn encode_diff(diff: &ResourceDiff) -> bytes::Bytes {
    let mut buf = serde_json::to_vec(diff).unwrap_or_else(|_| b"{}".to_vec());
    buf.push(b'\r');
    buf.into()
}

/// The body of a resource stream: the initial full snapshot followed by
/// every diff the subscription receives. Dropping the stream (the
/// client disconnected) drains residual diffs best-effort and
/// unregisters the subscriber.
struct DiffStream {
    initial: Option<bytes::Bytes>,
    receiver: mpsc::Receiver<ResourceDiff>,
    sender: mpsc::Sender<ResourceDiff>,
    resources: Arc<BackendResources>,
    dist_name: String,
}

impl futures::Stream for DiffStream {
    type Item = Result<bytes::Bytes, std::convert::Infallible>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            return std::task::Poll::Ready(Some(Ok(initial)));
        }
        match this.receiver.poll_recv(cx) {
            std::task::Poll::Ready(Some(diff)) => {
                std::task::Poll::Ready(Some(Ok(encode_diff(&diff))))
            }
            std::task::Poll::Ready(None) => std::task::Poll::Ready(None),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl Drop for DiffStream {
    fn drop(&mut self) {
        tracing::info!(
            "Exiting streaming loop for {:?}.",
            self.dist_name,
        );
        while self.receiver.try_recv().is_ok() {}
        self.resources
            .unregister_chan(&self.dist_name, &self.sender);
    }
}

async fn get_resource_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    state.metrics.inc_request("/resource-stream");
    if let Err(err) = authenticate(&state.config, &headers) {
        return error_response(err);
    }
    let req = match parse_resource_request(&body) {
        Ok(req) => req,
        Err(err) => return error_response(err),
    };

    let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
    state.resources.register_chan(&req, sender.clone());

    // The initial snapshot is built after registration so no update
    // can fall between the snapshot and the stream.
    let initial = ResourceDiff {
        new: working_resources(&state.resources, &req),
        full_update: true,
        ..Default::default()
    };
    tracing::info!(
        "Sending distributor initial batch: {}.",
        initial.new,
    );

    let stream = DiffStream {
        initial: Some(encode_diff(&initial)),
        receiver,
        sender,
        resources: state.resources.clone(),
        dist_name: req.request_origin.clone(),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .expect("building the stream response cannot fail")
}

async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.metrics.inc_request("/status");

    let Some(id) = params.get("id") else {
        return error_response(RdError::bad_request(
            "no 'id' parameter given",
        ));
    };
    let id = id.trim().to_uppercase();
    if id.is_empty() {
        return error_response(RdError::bad_request(
            "no 'id' parameter given",
        ));
    }

    let mut result = format!("Bridge {id} advertises:\n\n");
    let mut found_resource = false;

    for (rtype, group) in state.resources.collection().iter() {
        let matching = group.filter(|r| {
            let Some(fingerprint) = r.fingerprint() else {
                return false;
            };
            if fingerprint == id {
                return true;
            }
            hash_fingerprint(&fingerprint)
                .map(|hashed| hashed == id)
                .unwrap_or(false)
        });
        if !matching.is_empty() {
            found_resource = true;
        }

        for resource in matching {
            let test = resource.test_result();
            let status = match test.state {
                TestState::Untested => "not yet tested",
                TestState::Functional => "functional",
                TestState::Dysfunctional => "dysfunctional",
            };
            result.push_str(&format!("* {rtype}: {status}\n"));
            if test.speed != SpeedState::Untested {
                result.push_str(&format!("  Speed: {}\n", test.speed));
            }
            if let Some(ratio) = test.ratio {
                result.push_str(&format!("  Bandwidth Ratio: {ratio}\n"));
            }
            if !test.error.is_empty() {
                result.push_str(&format!("  Error: {}\n", test.error));
            }
            let blocked_in = resource.blocked_in();
            if !blocked_in.is_empty() {
                result.push_str(&format!("  Blocked in: {blocked_in}\n"));
            }
            if test.state != TestState::Untested {
                if let Some(last_tested) = test.last_tested {
                    result.push_str(&format!(
                        "  Last tested: {}s ago\n",
                        last_tested.elapsed().as_secs(),
                    ));
                }
            }
            result.push('\n');
        }
    }

    if !found_resource {
        return error_response(RdError::NotFound);
    }
    result.into_response()
}

async fn get_targets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    state.metrics.inc_request("/targets");
    if let Err(err) = authenticate(&state.config, &headers) {
        return error_response(err);
    }
    (StatusCode::NOT_IMPLEMENTED, "not yet implemented").into_response()
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}
