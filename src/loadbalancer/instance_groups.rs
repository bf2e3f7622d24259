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

//! Zonal instance groups holding the cluster nodes.
//!
//! Each zone gets groups named `{base}`, `{base}-1`, `{base}-2`, ... with at most
//! [`MAX_INSTANCES_PER_INSTANCE_GROUP`] members each. A VM is never a member of two of
//! these groups: every removal in a zone is applied before any addition.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::config::GceConfig;
use crate::constants::MAX_INSTANCES_PER_INSTANCE_GROUP;
use crate::errors::{ResourceContext, Result};
use crate::gce::{found, CloudCompute, GceError, InstanceGroup};
use crate::loadbalancer::namer;
use crate::utils;

#[derive(Default)]
struct ZoneIndex {
    nodes: BTreeMap<String, String>,
    zones: BTreeSet<String>,
}

/// Zones of the nodes seen so far, shared by all reconciliations.
///
/// Keeps zones after their last node is gone so their instance groups can still be
/// found and drained.
#[derive(Default)]
pub struct NodeZoneCache {
    inner: RwLock<ZoneIndex>,
}

impl NodeZoneCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the zones of `nodes` and returns node name to zone for them.
    ///
    /// A node without a zone label keeps the zone it had before, if any.
    pub async fn refresh(&self, nodes: &[&Node]) -> BTreeMap<String, String> {
        let mut index = self.inner.write().await;
        let mut zones = BTreeMap::new();
        for node in nodes {
            let name = node.name_any();
            let zone = match utils::node_zone(node) {
                Some(zone) => zone,
                None => match index.nodes.get(&name) {
                    Some(zone) => zone.clone(),
                    None => {
                        warn!("skipping node {}: no zone label", name);
                        continue;
                    }
                },
            };
            index.nodes.insert(name.clone(), zone.clone());
            index.zones.insert(zone.clone());
            zones.insert(name, zone);
        }
        zones
    }

    pub async fn zones(&self) -> Vec<String> {
        self.inner.read().await.zones.iter().cloned().collect()
    }
}

/// Nodes on the cluster's default subnetwork, when the cluster spans several.
///
/// A node belongs to the default subnetwork if its subnet label names it or is empty, or
/// if it has no label but already got a pod range.
pub(crate) fn filter_nodes_by_subnet<'a>(config: &GceConfig, nodes: &[&'a Node]) -> Vec<&'a Node> {
    if !config.multi_subnet_cluster {
        return nodes.to_vec();
    }
    let Some(default_subnet) = config.default_subnet_name() else {
        warn!(
            "cannot parse subnetwork {}, not filtering nodes by subnet",
            config.subnetwork_url
        );
        return nodes.to_vec();
    };
    nodes
        .iter()
        .copied()
        .filter(|node| match utils::node_subnet_label(node) {
            Some(label) => label.is_empty() || *label == default_subnet,
            None => utils::node_pod_cidr(node).is_some(),
        })
        .collect()
}

/// Number of shards needed for `n` nodes, zero for none.
pub(crate) fn shard_count(n: usize) -> usize {
    n.div_ceil(MAX_INSTANCES_PER_INSTANCE_GROUP)
}

/// Desired members of every shard.
///
/// Members stay in their current shard while it has room, so a scale event moves as few
/// VMs as possible. The rest go to the least loaded shard.
pub(crate) fn plan_shards(
    nodes: &BTreeSet<String>,
    existing: &BTreeMap<usize, BTreeSet<String>>,
) -> Vec<BTreeSet<String>> {
    let count = shard_count(nodes.len());
    if count == 0 {
        return vec![];
    }
    let capacity = nodes.len().div_ceil(count);
    let mut shards = vec![BTreeSet::new(); count];
    let mut placed = BTreeSet::new();
    for (index, members) in existing.range(..count) {
        for member in members {
            if shards[*index].len() >= capacity {
                break;
            }
            if nodes.contains(member) && placed.insert(member.clone()) {
                shards[*index].insert(member.clone());
            }
        }
    }
    for node in nodes {
        if placed.contains(node) {
            continue;
        }
        if let Some(shard) = shards.iter_mut().min_by_key(|s| s.len()) {
            shard.insert(node.clone());
        }
    }
    shards
}

pub(crate) struct InstanceGroupManager<'a> {
    pub cloud: &'a dyn CloudCompute,
    pub config: &'a GceConfig,
    pub zone_cache: &'a NodeZoneCache,
}

impl InstanceGroupManager<'_> {
    /// Converges the groups named after `base` and returns the links to put behind the
    /// backend service, reused external groups included.
    pub(crate) async fn ensure_instance_groups(
        &self,
        base: &str,
        nodes: &[&Node],
    ) -> Result<Vec<String>> {
        let candidates = filter_nodes_by_subnet(self.config, nodes);
        let node_zones = self.zone_cache.refresh(&candidates).await;
        let mut by_zone: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for zone in self.zone_cache.zones().await {
            by_zone.entry(zone).or_default();
        }
        for (node, zone) in node_zones {
            by_zone.entry(zone).or_default().insert(node);
        }

        let mut links = vec![];
        for (zone, mut members) in by_zone {
            if let Some(prefix) = &self.config.external_instance_groups_prefix {
                if !members.is_empty() {
                    let reused = self
                        .reuse_external_groups(&zone, prefix, base, &mut members)
                        .await?;
                    links.extend(reused);
                }
            }
            links.extend(self.sync_zone(&zone, base, &members).await?);
        }
        Ok(links)
    }

    /// Links of groups created outside the controller that already hold our nodes.
    /// Their members are taken out of `members`; the groups themselves are never modified.
    async fn reuse_external_groups(
        &self,
        zone: &str,
        prefix: &str,
        base: &str,
        members: &mut BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let groups = self
            .cloud
            .list_instance_groups(zone)
            .await
            .resource("instance groups in zone", zone)?;
        let mut links = vec![];
        for group in groups {
            if !group.name.starts_with(prefix)
                || namer::instance_group_shard_index(base, &group.name).is_some()
            {
                continue;
            }
            let instances = self.group_members(zone, &group.name).await?;
            if instances.is_empty() {
                continue;
            }
            let all_candidates = instances.iter().all(|i| members.contains(i));
            let all_nodes = instances
                .iter()
                .all(|i| i.starts_with(&self.config.node_instance_prefix));
            if !(all_candidates || all_nodes) {
                debug!(
                    "not reusing instance group {}: it holds instances that aren't nodes",
                    group.name
                );
                continue;
            }
            info!("reusing external instance group {} in zone {}", group.name, zone);
            for instance in &instances {
                members.remove(instance);
            }
            links.push(self.group_link(zone, &group));
        }
        Ok(links)
    }

    async fn sync_zone(
        &self,
        zone: &str,
        base: &str,
        members: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let groups = self
            .cloud
            .list_instance_groups(zone)
            .await
            .resource("instance groups in zone", zone)?;
        let mut existing: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for group in &groups {
            if let Some(index) = namer::instance_group_shard_index(base, &group.name) {
                let current = self.group_members(zone, &group.name).await?;
                existing.insert(index, current);
            }
        }
        let desired = plan_shards(members, &existing);

        for (index, current) in &existing {
            let keep = desired.get(*index);
            let stale: Vec<String> = current
                .iter()
                .filter(|m| !keep.is_some_and(|k| k.contains(*m)))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            let name = namer::instance_group_shard_name(base, *index);
            debug!("removing {} instances from {} in {}", stale.len(), name, zone);
            self.cloud
                .remove_instances(zone, &name, &stale)
                .await
                .resource("instance group", &name)?;
        }

        let mut links = vec![];
        for (index, wanted) in desired.iter().enumerate() {
            let name = namer::instance_group_shard_name(base, index);
            if !existing.contains_key(&index) {
                info!("creating instance group {} in zone {}", name, zone);
                let ig = InstanceGroup {
                    name: name.clone(),
                    network: self.config.network_url.clone(),
                    ..Default::default()
                };
                match self.cloud.insert_instance_group(zone, &ig).await {
                    Err(e) if e.is_already_exists() => {}
                    res => res.resource("instance group", &name)?,
                }
            }
            links.push(utils::build_zonal_instance_group_url(
                &self.config.project_id,
                zone,
                &name,
            ));
            let empty = BTreeSet::new();
            let current = existing.get(&index).unwrap_or(&empty);
            let missing: Vec<String> = wanted.difference(current).cloned().collect();
            if !missing.is_empty() {
                debug!("adding {} instances to {} in {}", missing.len(), name, zone);
                self.cloud
                    .add_instances(zone, &name, &missing)
                    .await
                    .resource("instance group", &name)?;
            }
        }

        for index in existing.keys().filter(|i| **i >= desired.len()) {
            let name = namer::instance_group_shard_name(base, *index);
            info!("deleting surplus instance group {} in zone {}", name, zone);
            self.delete_group(zone, &name).await?;
        }
        Ok(links)
    }

    /// Deletes every shard of `base` in every zone seen so far.
    pub(crate) async fn ensure_instance_groups_deleted(&self, base: &str) -> Result<()> {
        if self.config.skip_instance_group_deletion {
            debug!("skipping deletion of instance groups {}", base);
            return Ok(());
        }
        for zone in self.zone_cache.zones().await {
            let groups = match self.cloud.list_instance_groups(&zone).await {
                Err(e) if e.is_not_found() => continue,
                res => res.resource("instance groups in zone", &zone)?,
            };
            for group in groups {
                if namer::instance_group_shard_index(base, &group.name).is_some() {
                    self.delete_group(&zone, &group.name).await?;
                }
            }
        }
        Ok(())
    }

    /// Groups still referenced by a backend service are left for a later reconciliation.
    async fn delete_group(&self, zone: &str, name: &str) -> Result<()> {
        match self.cloud.delete_instance_group(zone, name).await {
            Ok(()) => info!("deleted instance group {} in zone {}", name, zone),
            Err(GceError::NotFound(_)) => {}
            Err(e) if e.is_in_use() => {
                debug!("instance group {} in zone {} is still in use: {}", name, zone, e)
            }
            Err(e) => return Err(e).resource("instance group", name),
        }
        Ok(())
    }

    async fn group_members(&self, zone: &str, name: &str) -> Result<BTreeSet<String>> {
        let instances = found(self.cloud.list_instances(zone, name).await)
            .resource("instance group", name)?
            .unwrap_or_default();
        Ok(instances
            .iter()
            .map(|url| utils::resource_name(url).to_string())
            .collect())
    }

    fn group_link(&self, zone: &str, group: &InstanceGroup) -> String {
        if group.self_link.is_empty() {
            utils::build_zonal_instance_group_url(&self.config.project_id, zone, &group.name)
        } else {
            group.self_link.clone()
        }
    }
}
