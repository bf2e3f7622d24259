// Copyright 2024 Google LLC
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

mod config;
mod constants;
mod controller;
mod errors;
mod events;
mod gce;
mod gcp_auth;
mod k8s;
mod loadbalancer;
mod utils;

use anyhow::Context;
use clap::{ArgAction, Parser};
use env_logger::Env;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GceConfig;
use crate::events::{EventRecorder, KubeEventRecorder};
use crate::gce::client::ComputeClient;
use crate::k8s::{KubeServiceWriter, ServiceWriter};
use crate::loadbalancer::GceLoadBalancer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let config = GceConfig::from_args(&args)
        .await
        .with_context(|| "failed to load the controller configuration")?;
    let state = State::new(config, Duration::from_secs(args.resync_period_secs));
    tokio::try_join!(controller::run(state.clone()))
        .with_context(|| "error occurred running the controller")?;

    Ok(())
}

#[derive(Clone)]
pub struct State {
    config: Arc<GceConfig>,
    resync_period: Duration,
}

impl State {
    pub fn new(config: GceConfig, resync_period: Duration) -> Self {
        State {
            config: Arc::new(config),
            resync_period,
        }
    }

    pub fn to_context(&self, client: Client) -> Arc<Ctx> {
        let writer: Arc<dyn ServiceWriter> = Arc::new(KubeServiceWriter::new(client.clone()));
        let events: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(client.clone()));
        let cloud = Arc::new(ComputeClient::new(&self.config));
        let lb = GceLoadBalancer::new(cloud, self.config.clone(), writer.clone(), events.clone());
        Arc::new(Ctx {
            client,
            lb,
            writer,
            events,
            resync_period: self.resync_period,
        })
    }
}

pub struct Ctx {
    pub client: Client,
    pub lb: GceLoadBalancer,
    pub writer: Arc<dyn ServiceWriter>,
    pub events: Arc<dyn EventRecorder>,
    pub resync_period: Duration,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct Args {
    #[arg(long, default_value = "")]
    pub(crate) region: String,
    #[arg(long, default_value = "")]
    pub(crate) project_id: String,
    #[arg(long)]
    pub(crate) network: String,
    #[arg(long, default_value = "")]
    pub(crate) subnetwork: String,
    #[arg(long, default_value = "")]
    pub(crate) shared_vpc_project_id: String,
    #[arg(long, default_value = "")]
    pub(crate) cluster_id: String,
    /// Comma separated network tags of the cluster nodes, used as firewall targets.
    #[arg(long, default_value = "")]
    pub(crate) node_tags: String,
    #[arg(long, default_value = "")]
    pub(crate) node_instance_prefix: String,
    /// Instance groups with this prefix that already hold cluster nodes are reused as backends.
    #[arg(long, default_value = "")]
    pub(crate) external_instance_groups_prefix: String,
    #[arg(long)]
    pub(crate) multi_subnet_cluster: bool,
    #[arg(long)]
    pub(crate) enable_deny_firewall: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub(crate) deny_firewall_rollback_cleanup: bool,
    #[arg(long)]
    pub(crate) skip_instance_group_deletion: bool,
    #[arg(long, default_value_t = 600)]
    pub(crate) resync_period_secs: u64,
}
