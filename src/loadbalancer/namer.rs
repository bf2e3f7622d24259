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

//! Deterministic names for every cloud resource a load balancer owns or shares.
//!
//! All names are lowercase, at most 63 characters, and derived only from the Service UID
//! and the cluster id, so every reconciliation finds the resources the previous one made.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::constants::MAX_RESOURCE_NAME_LENGTH;
use crate::gce::LbScheme;
use crate::utils;

const LB_NAME_MAX_LENGTH: usize = 32;
const TRUNCATED_PREFIX_LENGTH: usize = 54;
const TRUNCATED_HASH_LENGTH: usize = 8;

fn hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keeps names that fit, otherwise a 54 character prefix, `-` and 8 hash characters.
pub(crate) fn truncate_name(name: String) -> String {
    if name.len() <= MAX_RESOURCE_NAME_LENGTH {
        return name;
    }
    format!(
        "{}-{}",
        &name[..TRUNCATED_PREFIX_LENGTH],
        &hash(&name)[..TRUNCATED_HASH_LENGTH]
    )
}

pub(crate) fn load_balancer_name(svc: &Service) -> String {
    let mut name = format!("a{}", svc.uid().unwrap_or_default().replace('-', ""));
    name.truncate(LB_NAME_MAX_LENGTH);
    name.to_lowercase()
}

pub(crate) fn backend_service_name(
    lb_name: &str,
    cluster_id: &str,
    shared: bool,
    scheme: LbScheme,
    protocol: &str,
    session_affinity: &str,
) -> String {
    if !shared {
        return lb_name.to_string();
    }
    let name = format!(
        "k8s-{}-{}-{}-nmv1-{}",
        cluster_id,
        scheme.as_str(),
        protocol,
        &hash(session_affinity)[..16]
    );
    truncate_name(name.to_lowercase())
}

/// Each flavour gets its own shared node health check, since the health check firewall
/// carries scheme specific prober ranges.
pub(crate) fn health_check_name(
    lb_name: &str,
    cluster_id: &str,
    shared: bool,
    scheme: LbScheme,
) -> String {
    if !shared {
        return lb_name.to_string();
    }
    match scheme {
        LbScheme::Internal => truncate_name(format!("k8s-{}-node", cluster_id)),
        LbScheme::External => truncate_name(format!("k8s-{}-node-http", cluster_id)),
    }
}

pub(crate) fn health_check_firewall_name(hc_name: &str) -> String {
    truncate_name(format!("{}-hc", hc_name))
}

pub(crate) fn allow_firewall_name(lb_name: &str, scheme: LbScheme) -> String {
    match scheme {
        LbScheme::Internal => lb_name.to_string(),
        LbScheme::External => truncate_name(format!("k8s-fw-{}", lb_name)),
    }
}

pub(crate) fn deny_firewall_name(allow_name: &str) -> String {
    truncate_name(format!("{}-deny", allow_name))
}

pub(crate) fn instance_group_name(cluster_id: &str) -> String {
    truncate_name(format!("k8s-ig--{}", cluster_id))
}

/// Shard 0 is the base name itself.
pub(crate) fn instance_group_shard_name(base: &str, shard: usize) -> String {
    match shard {
        0 => base.to_string(),
        n => format!("{}-{}", base, n),
    }
}

/// Inverse of [`instance_group_shard_name`], `None` for groups that aren't shards of `base`.
pub(crate) fn instance_group_shard_index(base: &str, name: &str) -> Option<usize> {
    if name == base {
        return Some(0);
    }
    let suffix = name.strip_prefix(base)?.strip_prefix('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().filter(|n| *n > 0)
}

/// Description tying a per-service resource to its Service. Shared resources have none.
pub(crate) fn description(svc: &Service, shared: bool) -> String {
    if shared {
        return String::new();
    }
    json!({"kubernetes.io/service-name": utils::service_key(svc)}).to_string()
}
