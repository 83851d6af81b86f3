// Copyright 2025 Smart Scheduler Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP surfaces: the TLS admission endpoint, the health probes, and the
//! plain-text counter endpoint.

use crate::stats::Stats;
use crate::utils::tls;
use crate::webhook::PodMutator;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1 as corev1;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use snafu::{ResultExt, Snafu};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load webhook serving certificates: {}", source))]
    Certificates { source: tls::Error },

    #[snafu(display("failed to bind {}: {}", addr, source))]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[snafu(display("server error: {}", source))]
    Serve { source: std::io::Error },
}

#[derive(Clone)]
pub struct AppState {
    pub mutator: Arc<PodMutator>,
    pub stats: Arc<Stats>,
}

/// Serve `/mutate-v1-pod` over TLS.
pub async fn serve_webhook(
    addr: SocketAddr,
    cert_dir: &Path,
    state: AppState,
) -> Result<(), Error> {
    let tls_config = tls::load_server_config(cert_dir).context(CertificatesSnafu)?;

    let app = Router::new()
        .route("/mutate-v1-pod", post(mutate))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!(%addr, "starting admission webhook server");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls_config)))
        .serve(app.into_make_service())
        .await
        .context(ServeSnafu)
}

/// Liveness and readiness probes. Leader election is held by an external
/// collaborator, so readiness does not gate on a lease.
pub async fn serve_probes(addr: SocketAddr) -> Result<(), Error> {
    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(ready_check));

    info!(%addr, "starting health probe server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(BindSnafu { addr })?;
    axum::serve(listener, app).await.context(ServeSnafu)
}

/// Logical counters as plain text.
pub async fn serve_stats(addr: SocketAddr, stats: Arc<Stats>) -> Result<(), Error> {
    let app = Router::new()
        .route("/metrics", get(render_stats))
        .with_state(stats);

    info!(%addr, "starting counter endpoint");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(BindSnafu { addr })?;
    axum::serve(listener, app).await.context(ServeSnafu)
}

async fn mutate(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<corev1::Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<corev1::Pod> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "malformed admission review");
            return Json(AdmissionResponse::invalid(error.to_string()).into_review());
        }
    };

    Json(state.mutator.handle(request).await.into_review())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn ready_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

async fn render_stats(State(stats): State<Arc<Stats>>) -> impl IntoResponse {
    (StatusCode::OK, stats.render())
}
