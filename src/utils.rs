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

use k8s_openapi::api::core::v1::{Node, Service, ServicePort};
use kube::ResourceExt;

use crate::constants::{
    ALL_IPV4_CIDR, ILB_GLOBAL_ACCESS_ANNOTATION_KEY, ILB_SUBNET_ANNOTATION_KEY,
    LB_SOURCE_RANGES_ANNOTATION_KEY, LB_TYPE_ANNOTATION_KEY, LB_TYPE_ANNOTATION_KEY_LEGACY,
    LB_TYPE_INTERNAL, NODE_EXCLUDE_LB_LABEL_KEY, NODE_SUBNET_LABEL_KEY, NODE_ZONE_LABEL_KEY,
    NODE_ZONE_LABEL_KEY_LEGACY,
};

pub(crate) fn service_key(svc: &Service) -> String {
    format!("{}/{}", svc.namespace().unwrap_or_default(), svc.name_any())
}

pub(crate) fn is_svc_type_lb(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .map(|spec| spec.type_.eq(&"LoadBalancer".to_string().into()))
        .eq(&Some(true))
}

pub(crate) fn service_ports(svc: &Service) -> Vec<&ServicePort> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .collect()
}

pub(crate) fn port_protocol(port: &ServicePort) -> String {
    port.protocol
        .clone()
        .unwrap_or_else(|| String::from("TCP"))
        .to_uppercase()
}

pub(crate) fn has_finalizer(svc: &Service, finalizer: &str) -> bool {
    svc.finalizers().iter().any(|f| f.eq(finalizer))
}

pub(crate) fn is_internal_lb_requested(svc: &Service) -> bool {
    let annotations = svc.annotations();
    [LB_TYPE_ANNOTATION_KEY, LB_TYPE_ANNOTATION_KEY_LEGACY]
        .iter()
        .any(|k| annotations.get(*k).map(String::as_str) == Some(LB_TYPE_INTERNAL))
}

pub(crate) fn requests_only_local_traffic(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.external_traffic_policy.as_deref())
        .eq(&Some("Local"))
}

pub(crate) fn health_check_node_port(svc: &Service) -> Option<i32> {
    svc.spec.as_ref().and_then(|spec| spec.health_check_node_port)
}

pub(crate) fn load_balancer_ip(svc: &Service) -> String {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_ip.clone())
        .unwrap_or_default()
}

/// Firewall source ranges: `loadBalancerSourceRanges`, then the legacy annotation, then everything.
pub(crate) fn source_ranges(svc: &Service) -> Vec<String> {
    let mut ranges: Vec<String> = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_source_ranges.clone())
        .unwrap_or_default();
    if ranges.is_empty() {
        if let Some(val) = svc.annotations().get(LB_SOURCE_RANGES_ANNOTATION_KEY) {
            ranges = val
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }
    }
    if ranges.is_empty() {
        ranges.push(String::from(ALL_IPV4_CIDR));
    }
    ranges.sort();
    ranges.dedup();
    ranges
}

pub(crate) fn session_affinity(svc: &Service) -> &'static str {
    match svc
        .spec
        .as_ref()
        .and_then(|spec| spec.session_affinity.as_deref())
    {
        Some("ClientIP") => "CLIENT_IP",
        _ => "NONE",
    }
}

pub(crate) fn allows_global_access(svc: &Service) -> bool {
    svc.annotations()
        .get(ILB_GLOBAL_ACCESS_ANNOTATION_KEY)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub(crate) fn ilb_subnet(svc: &Service) -> Option<String> {
    svc.annotations()
        .get(ILB_SUBNET_ANNOTATION_KEY)
        .filter(|s| !s.is_empty())
        .cloned()
}

pub(crate) fn node_zone(node: &Node) -> Option<String> {
    let labels = node.labels();
    labels
        .get(NODE_ZONE_LABEL_KEY)
        .or_else(|| labels.get(NODE_ZONE_LABEL_KEY_LEGACY))
        .filter(|z| !z.is_empty())
        .cloned()
}

pub(crate) fn node_subnet_label(node: &Node) -> Option<&String> {
    node.labels().get(NODE_SUBNET_LABEL_KEY)
}

pub(crate) fn node_pod_cidr(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.pod_cidr.as_deref())
        .filter(|cidr| !cidr.is_empty())
}

pub(crate) fn is_node_excluded_from_lb(node: &Node) -> bool {
    node.labels().contains_key(NODE_EXCLUDE_LB_LABEL_KEY)
}

pub(crate) fn build_instance_url(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{}/zones/{}/instances/{}", project, zone, name)
}

pub(crate) fn build_zonal_instance_group_url(
    project: &str,
    zone: &str,
    group_name: &str,
) -> String {
    format!(
        "projects/{}/zones/{}/instanceGroups/{}",
        project, zone, group_name
    )
}

pub(crate) fn build_health_check_url(project: &str, region: &str, name: &str) -> String {
    format!(
        "projects/{}/regions/{}/healthChecks/{}",
        project, region, name
    )
}

pub(crate) fn build_backend_svc_url(project: &str, region: &str, name: &str) -> String {
    format!(
        "projects/{}/regions/{}/backendServices/{}",
        project, region, name
    )
}

#[cfg(test)]
pub(crate) fn build_forwarding_rule_url(project: &str, region: &str, name: &str) -> String {
    format!(
        "projects/{}/regions/{}/forwardingRules/{}",
        project, region, name
    )
}

#[cfg(test)]
pub(crate) fn build_address_url(project: &str, region: &str, name: &str) -> String {
    format!("projects/{}/regions/{}/addresses/{}", project, region, name)
}

#[cfg(test)]
pub(crate) fn build_firewall_url(project: &str, name: &str) -> String {
    format!("projects/{}/global/firewalls/{}", project, name)
}

/// The `projects/...` part of a resource link, so links that differ only in API host or
/// version compare equal.
pub(crate) fn resource_path(link: &str) -> &str {
    match link.find("projects/") {
        Some(i) => &link[i..],
        None => link,
    }
}

pub(crate) fn links_equal(a: &str, b: &str) -> bool {
    resource_path(a) == resource_path(b)
}

pub(crate) fn resource_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}
