//! The proxy's HTTP surface.
//!
//! One listener serves both sides of the rendezvous: collectors reach the
//! proxy with ordinary proxied GETs (absolute-form request URI), clients
//! speak `/poll` and `/push`, and service discovery reads `/clients`.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use url::Url;

use crate::{
    config::ProxyArgs,
    coordinator::{normalize_fqdn, Coordinator},
    wire::{self, ScrapeRequest},
};

/// One live client in the `/clients` listing, shaped for HTTP service
/// discovery: a single-target group with no extra labels.
#[derive(Debug, Serialize)]
struct TargetGroup {
    targets: Vec<String>,
    labels: HashMap<String, String>,
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/poll", post(poll))
        .route("/push", post(push))
        .route("/clients", get(clients))
        .fallback(scrape)
        .with_state(coordinator)
}

pub async fn run(args: ProxyArgs) -> anyhow::Result<()> {
    let coordinator = Arc::new(
        Coordinator::builder()
            .registration_timeout(args.registration_timeout)
            .default_scrape_timeout(args.default_scrape_timeout)
            .max_scrape_timeout(args.max_scrape_timeout)
            .build(),
    );
    let gc = coordinator.spawn_gc();

    let addr = args.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, "proxy listening");

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    gc.abort();
    Ok(())
}

/// Collector-side entry: any request whose URI names a host is brokered to
/// the matching client; everything else is an unknown route.
async fn scrape(State(coordinator): State<Arc<Coordinator>>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let Some(url) = absolute_url(&parts.uri) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    tracing::info!(%url, method = %parts.method, "proxying scrape");

    let request = ScrapeRequest {
        method: parts.method,
        url,
        headers: parts.headers,
    };
    match coordinator.do_scrape(request).await {
        Ok(response) => response.map(Body::from).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Client-side long poll. The body is the client's FQDN; the response body
/// is the wire-format request the client must perform.
async fn poll(State(coordinator): State<Arc<Coordinator>>, body: String) -> Response {
    let key = normalize_fqdn(&body);
    if key.starts_with(':') {
        return (StatusCode::BAD_REQUEST, "poll body carries no fqdn").into_response();
    }
    let instruction = coordinator.wait_for_instruction(&key).await;
    tracing::info!(%key, url = %instruction.url, "delivering scrape instruction");
    instruction.encode().into_response()
}

/// Client-side result push. The body is the wire-format response of the
/// scrape the client performed.
async fn push(State(coordinator): State<Arc<Coordinator>>, body: Bytes) -> Response {
    let response = match wire::parse_response(&body) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "discarding unparsable push");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };
    match coordinator.scrape_result(response).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "push not delivered");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn clients(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<TargetGroup>> {
    let mut targets = coordinator.live_clients();
    targets.sort();
    Json(
        targets
            .into_iter()
            .map(|target| TargetGroup {
                targets: vec![target],
                labels: HashMap::new(),
            })
            .collect(),
    )
}

fn absolute_url(uri: &http::Uri) -> Option<Url> {
    uri.host()?;
    Url::parse(&uri.to_string()).ok()
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("shutdown signal received, stopping server");
}
