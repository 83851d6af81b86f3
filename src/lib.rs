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

use crate::context::Context;
use crate::reconcile::policy::{PolicyContext, error_policy as policy_error_policy, reconcile_policy};
use crate::reconcile::rebalance::{
    RebalanceContext, RecorderEmitter, error_policy as rebalance_error_policy,
    map_pod_to_workload, reconcile_rebalance,
};
use crate::state::{ApiPodLister, StateStore, SystemClock};
use crate::stats::Stats;
use crate::types::v1alpha1::policy::PodPlacementPolicy;
use crate::webhook::server::AppState;
use crate::webhook::{ApiOwnerLookup, PodMutator};
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

pub mod annotations;
pub mod config;
mod context;
pub mod placement;
pub mod reconcile;
pub mod state;
pub mod stats;
pub mod strategy;
pub mod types;
pub mod utils;
pub mod webhook;

#[cfg(test)]
pub(crate) mod tests;

pub use config::Config;

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_max_level(if config.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    info!(
        webhook_port = config.webhook_port,
        leader_elect = config.leader_elect,
        namespaces = ?config.watch_namespaces,
        "starting smart-scheduler manager"
    );

    let client = Client::try_default().await?;
    let context = Arc::new(Context::new(client.clone()));
    let stats = Arc::new(Stats::default());
    let pods: Arc<ApiPodLister> = Arc::new(ApiPodLister::new(client.clone()));
    let clock = Arc::new(SystemClock);

    let mutator = Arc::new(PodMutator::new(
        Arc::new(ApiOwnerLookup::new(client.clone())),
        StateStore::new(client.clone()),
        stats.clone(),
    ));

    let rebalance_ctx = Arc::new(RebalanceContext {
        ctx: context.clone(),
        store: StateStore::new(client.clone()),
        pods: pods.clone(),
        emitter: Arc::new(RecorderEmitter::new(client.clone())),
        clock: clock.clone(),
        stats: stats.clone(),
        namespaces: config.watch_namespaces.clone(),
    });

    let rebalance_controller = Controller::new(
        scoped_api::<appsv1::Deployment>(&client, &config),
        watcher::Config::default(),
    )
    .watches(
        scoped_api::<corev1::Pod>(&client, &config),
        watcher::Config::default(),
        map_pod_to_workload,
    )
    .with_config(ControllerConfig::default().concurrency(1))
    .run(reconcile_rebalance, rebalance_error_policy, rebalance_ctx)
    .for_each(|result| async move {
        match result {
            Ok((workload, _)) => info!("rebalance reconciled, object {:?}", workload.name),
            Err(error) => warn!("rebalance reconcile failed: {}", error),
        }
    });

    let policy_ctx = Arc::new(PolicyContext {
        ctx: context.clone(),
        pods: pods.clone(),
        clock: clock.clone(),
        namespaces: config.watch_namespaces.clone(),
    });

    let policy_controller = Controller::new(
        scoped_api::<PodPlacementPolicy>(&client, &config),
        watcher::Config::default(),
    )
    .with_config(ControllerConfig::default().concurrency(2))
    .run(reconcile_policy, policy_error_policy, policy_ctx)
    .for_each(|result| async move {
        match result {
            Ok((policy, _)) => info!("policy reconciled, object {:?}", policy.name),
            Err(error) => warn!("policy reconcile failed: {}", error),
        }
    });

    let webhook_addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    let app_state = AppState { mutator, stats: stats.clone() };
    let webhook_server = webhook::server::serve_webhook(webhook_addr, &config.cert_dir, app_state);
    let probe_server = webhook::server::serve_probes(config.health_probe_bind_address);
    let stats_server = webhook::server::serve_stats(config.metrics_bind_address, stats.clone());

    tokio::select! {
        _ = rebalance_controller => {}
        _ = policy_controller => {}
        result = webhook_server => result?,
        result = probe_server => result?,
        result = stats_server => result?,
    }

    Ok(())
}

/// kube Controllers take a single Api scope; with more than one requested
/// namespace the watch falls back to cluster scope and each reconcile
/// filters by namespace itself.
fn scoped_api<T>(client: &Client, config: &Config) -> Api<T>
where
    T: Clone + DeserializeOwned + Debug + Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
{
    match config.watch_namespaces.as_slice() {
        [namespace] => Api::namespaced(client.clone(), namespace),
        _ => Api::all(client.clone()),
    }
}

pub async fn crd(file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Pin<Box<dyn AsyncWrite + Send>> = if let Some(file) = file {
        Box::pin(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(file)
                .await?,
        )
    } else {
        Box::pin(tokio::io::stdout())
    };

    writer
        .write_all(serde_yaml_ng::to_string(&PodPlacementPolicy::crd())?.as_bytes())
        .await?;

    Ok(())
}
