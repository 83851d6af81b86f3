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

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Start-time configuration for the controller manager.
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// The address the counter endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// The address the probe endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// The port the webhook server serves at.
    #[arg(long, default_value_t = 9443)]
    pub webhook_port: u16,

    /// The directory containing the webhook server certificates.
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    pub cert_dir: PathBuf,

    /// Run under an externally managed leader-election lease.
    #[arg(long)]
    pub leader_elect: bool,

    /// Namespace to watch; repeatable. Empty watches all namespaces.
    #[arg(long = "watch-namespace")]
    pub watch_namespaces: Vec<String>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}
