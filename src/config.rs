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

use log::debug;
use regex::Regex;

use crate::errors::{Error, Result};
use crate::{gcp_auth, Args};

/// Everything the load balancer engine needs to know about the cluster and its project.
///
/// Built once at startup and shared read-only, feature flags included, so concurrent
/// reconciliations never observe a flag flipping underneath them.
#[derive(Clone, Debug, Default)]
pub struct GceConfig {
    pub project_id: String,
    pub region: String,
    /// Project owning the network. Differs from `project_id` in a shared VPC.
    pub network_project_id: String,
    pub network_url: String,
    pub subnetwork_url: String,
    pub cluster_id: String,
    pub node_tags: Vec<String>,
    pub node_instance_prefix: String,
    pub external_instance_groups_prefix: Option<String>,
    pub multi_subnet_cluster: bool,
    pub enable_deny_firewall: bool,
    pub deny_firewall_rollback_cleanup: bool,
    pub skip_instance_group_deletion: bool,
}

impl GceConfig {
    pub(crate) async fn from_args(args: &Args) -> anyhow::Result<Self> {
        let project_id = gcp_auth::get_project_id(&args.project_id).await?;
        let region = gcp_auth::get_region(&args.region).await?;
        let config = Self::build(args, project_id, region)?;
        debug!("loaded configuration: {:?}", config);
        Ok(config)
    }

    pub(crate) fn build(args: &Args, project_id: String, region: String) -> Result<Self> {
        if args.cluster_id.is_empty() {
            return Err(Error::ConfigError("--cluster-id must not be empty".into()));
        }
        let network_project_id = if args.shared_vpc_project_id.is_empty() {
            project_id.clone()
        } else {
            args.shared_vpc_project_id.clone()
        };
        let network_url = if args.network.contains('/') {
            args.network.clone()
        } else {
            format!(
                "projects/{}/global/networks/{}",
                network_project_id, args.network
            )
        };
        let subnetwork_url = if args.subnetwork.is_empty() || args.subnetwork.contains('/') {
            args.subnetwork.clone()
        } else {
            format!(
                "projects/{}/regions/{}/subnetworks/{}",
                network_project_id, region, args.subnetwork
            )
        };
        Ok(GceConfig {
            project_id,
            region,
            network_project_id,
            network_url,
            subnetwork_url,
            cluster_id: args.cluster_id.to_lowercase(),
            node_tags: args
                .node_tags
                .split(',')
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            node_instance_prefix: args.node_instance_prefix.clone(),
            external_instance_groups_prefix: Some(args.external_instance_groups_prefix.clone())
                .filter(|p| !p.is_empty()),
            multi_subnet_cluster: args.multi_subnet_cluster,
            enable_deny_firewall: args.enable_deny_firewall,
            deny_firewall_rollback_cleanup: args.deny_firewall_rollback_cleanup,
            skip_instance_group_deletion: args.skip_instance_group_deletion,
        })
    }

    pub fn is_xpn(&self) -> bool {
        self.network_project_id != self.project_id
    }

    /// Name of the cluster's default subnetwork, `None` when the configured URL can't be parsed.
    pub fn default_subnet_name(&self) -> Option<String> {
        let re = Regex::new(r"(^|/)projects/[^/]+/regions/[^/]+/subnetworks/(?P<name>[^/]+)$")
            .ok()?;
        re.captures(&self.subnetwork_url)
            .map(|caps| String::from(&caps["name"]))
    }

    pub fn subnetwork_url_for(&self, subnet_name: &str) -> String {
        format!(
            "projects/{}/regions/{}/subnetworks/{}",
            self.network_project_id, self.region, subnet_name
        )
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> GceConfig {
    GceConfig {
        project_id: "test-project".into(),
        region: "us-central1".into(),
        network_project_id: "test-project".into(),
        network_url: "projects/test-project/global/networks/default".into(),
        subnetwork_url: "projects/test-project/regions/us-central1/subnetworks/default".into(),
        cluster_id: "c0ffee".into(),
        node_tags: vec!["gke-node".into()],
        node_instance_prefix: "gke-test-".into(),
        external_instance_groups_prefix: None,
        multi_subnet_cluster: false,
        enable_deny_firewall: false,
        deny_firewall_rollback_cleanup: true,
        skip_instance_group_deletion: false,
    }
}
