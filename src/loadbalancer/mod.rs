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

//! L4 load balancer reconciliation for internal (ILB) and external (NetLB) passthrough
//! load balancers.
//!
//! Every call recomputes the desired resources from the Service and the nodes, compares
//! them with what the compute API reports and writes only the differences. A failed step
//! aborts the call without undoing earlier steps; the next call picks up from there.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use log::{debug, info, warn};

use crate::config::GceConfig;
use crate::constants::{
    ILB_FINALIZER_V1, ILB_FINALIZER_V2, LB_PORTS_ERROR_CONDITION, MIXED_PROTOCOL_ERROR,
    MIXED_PROTOCOL_REASON, NETLB_FINALIZER_LEGACY, NETLB_FINALIZER_RBS,
    NODES_HEALTH_CHECK_PORT, RBS_ANNOTATION_KEY, RBS_ENABLED,
};
use crate::errors::{Error, ResourceContext, Result};
use crate::events::EventRecorder;
use crate::gce::{found, ignore_not_found, CloudCompute, ForwardingRule, LbScheme};
use crate::k8s::ServiceWriter;
use crate::utils;

use backend::{BackendManager, BackendServiceParams};
use firewall::{FirewallManager, FirewallPlan};
use forwarding_rule::{AddressManager, ForwardingRuleManager, RuleParams};
use instance_groups::{InstanceGroupManager, NodeZoneCache};

pub(crate) mod backend;
pub(crate) mod firewall;
pub(crate) mod forwarding_rule;
pub(crate) mod instance_groups;
pub(crate) mod namer;

/// Who is responsible for a Service's load balancer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagementState {
    /// Another controller implements it.
    Unmanaged,
    Managed(LbScheme),
    /// Deletion requested and our finalizer for the scheme still present.
    Deleting(LbScheme),
    /// Deletion requested and nothing left for us to clean up.
    Deleted,
}

pub(crate) fn finalizer_for(scheme: LbScheme) -> &'static str {
    match scheme {
        LbScheme::Internal => ILB_FINALIZER_V1,
        LbScheme::External => NETLB_FINALIZER_LEGACY,
    }
}

pub(crate) fn has_our_finalizer(svc: &Service) -> bool {
    [LbScheme::Internal, LbScheme::External]
        .iter()
        .any(|s| utils::has_finalizer(svc, finalizer_for(*s)))
}

pub fn classify(svc: &Service) -> ManagementState {
    let scheme = if utils::is_internal_lb_requested(svc) {
        LbScheme::Internal
    } else {
        LbScheme::External
    };
    let has_class = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_class.as_ref())
        .is_some();
    let elsewhere = match scheme {
        LbScheme::Internal => utils::has_finalizer(svc, ILB_FINALIZER_V2),
        LbScheme::External => {
            utils::has_finalizer(svc, NETLB_FINALIZER_RBS)
                || svc
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(RBS_ANNOTATION_KEY))
                    .is_some_and(|v| v == RBS_ENABLED)
        }
    };
    if has_class || elsewhere {
        return ManagementState::Unmanaged;
    }
    if svc.metadata.deletion_timestamp.is_none() {
        return ManagementState::Managed(scheme);
    }
    if utils::has_finalizer(svc, finalizer_for(scheme)) {
        ManagementState::Deleting(scheme)
    } else if utils::has_finalizer(svc, finalizer_for(scheme.other())) {
        ManagementState::Deleting(scheme.other())
    } else {
        ManagementState::Deleted
    }
}

/// Service attributes every step needs.
struct LbSpec {
    lb_name: String,
    protocol: String,
    ports: Vec<i32>,
    /// Shared node health check and backend service, unless traffic stays node local.
    shared: bool,
    health_check_port: i32,
}

pub struct GceLoadBalancer {
    cloud: Arc<dyn CloudCompute>,
    config: Arc<GceConfig>,
    writer: Arc<dyn ServiceWriter>,
    events: Arc<dyn EventRecorder>,
    zone_cache: NodeZoneCache,
}

impl GceLoadBalancer {
    pub fn new(
        cloud: Arc<dyn CloudCompute>,
        config: Arc<GceConfig>,
        writer: Arc<dyn ServiceWriter>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        GceLoadBalancer {
            cloud,
            config,
            writer,
            events,
            zone_cache: NodeZoneCache::new(),
        }
    }

    /// Records node zones so deletion can find instance groups in every zone.
    pub async fn observe_nodes(&self, nodes: &[Node]) {
        let nodes: Vec<&Node> = nodes.iter().collect();
        self.zone_cache.refresh(&nodes).await;
    }

    fn firewalls(&self) -> FirewallManager<'_> {
        FirewallManager {
            cloud: self.cloud.as_ref(),
            config: &self.config,
            events: self.events.as_ref(),
        }
    }

    fn backends(&self) -> BackendManager<'_> {
        BackendManager {
            cloud: self.cloud.as_ref(),
            config: &self.config,
        }
    }

    fn instance_groups(&self) -> InstanceGroupManager<'_> {
        InstanceGroupManager {
            cloud: self.cloud.as_ref(),
            config: &self.config,
            zone_cache: &self.zone_cache,
        }
    }

    /// The load balancer status and whether its forwarding rule exists.
    pub async fn get_load_balancer(
        &self,
        svc: &Service,
    ) -> Result<(Option<LoadBalancerStatus>, bool)> {
        if classify(svc) == ManagementState::Unmanaged {
            return Ok((None, false));
        }
        let lb_name = namer::load_balancer_name(svc);
        let rule = found(self.cloud.get_forwarding_rule(&lb_name).await)
            .resource("forwarding rule", &lb_name)?;
        Ok(match rule {
            Some(rule) => (Some(status_for(&rule)), true),
            None => (None, false),
        })
    }

    pub async fn ensure_load_balancer(
        &self,
        svc: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let scheme = match classify(svc) {
            ManagementState::Unmanaged => return Err(Error::ImplementedElsewhere),
            ManagementState::Managed(scheme) => scheme,
            ManagementState::Deleting(_) | ManagementState::Deleted => {
                return Err(Error::Validation(format!(
                    "service {} is being deleted",
                    utils::service_key(svc)
                )))
            }
        };
        let spec = self.validate(svc).await?;
        let nodes: Vec<&Node> = nodes
            .iter()
            .filter(|n| !utils::is_node_excluded_from_lb(n))
            .collect();

        let other = finalizer_for(scheme.other());
        if utils::has_finalizer(svc, other) {
            info!(
                "switching service {} to a {} load balancer",
                utils::service_key(svc),
                scheme.as_str().to_lowercase()
            );
            self.delete_resources(svc, scheme.other(), false).await?;
            self.writer.remove_finalizer(svc, other).await?;
        }
        if !utils::has_finalizer(svc, finalizer_for(scheme)) {
            self.writer
                .add_finalizer(svc, finalizer_for(scheme))
                .await?;
        }

        let existing_rule = found(self.cloud.get_forwarding_rule(&spec.lb_name).await)
            .resource("forwarding rule", &spec.lb_name)?;

        let cluster_id = &self.config.cluster_id;
        let description = namer::description(svc, false);
        let shared_description = namer::description(svc, spec.shared);

        let ig_links = self
            .instance_groups()
            .ensure_instance_groups(&namer::instance_group_name(cluster_id), &nodes)
            .await?;

        let hc_name = namer::health_check_name(&spec.lb_name, cluster_id, spec.shared, scheme);
        let hc_link = self
            .backends()
            .ensure_health_check(&hc_name, &shared_description, spec.health_check_port)
            .await?;

        let affinity = utils::session_affinity(svc);
        let bs_name = namer::backend_service_name(
            &spec.lb_name,
            cluster_id,
            spec.shared,
            scheme,
            &spec.protocol,
            affinity,
        );
        let bs_link = self
            .backends()
            .ensure_backend_service(BackendServiceParams {
                name: &bs_name,
                description: &shared_description,
                protocol: &spec.protocol,
                scheme,
                session_affinity: affinity,
                health_check_link: &hc_link,
                instance_groups: &ig_links,
            })
            .await?;

        let subnetwork = match scheme {
            LbScheme::Internal => utils::ilb_subnet(svc)
                .map(|s| self.config.subnetwork_url_for(&s))
                .unwrap_or_else(|| self.config.subnetwork_url.clone()),
            LbScheme::External => String::new(),
        };
        let ip = requested_ip(svc, existing_rule.as_ref(), &subnetwork);
        let desired_rule = forwarding_rule::desired_forwarding_rule(
            &self.config,
            RuleParams {
                name: &spec.lb_name,
                description: &description,
                scheme,
                protocol: &spec.protocol,
                ports: &spec.ports,
                ip: &ip,
                backend_service: &bs_link,
                subnetwork: &subnetwork,
                allow_global_access: utils::allows_global_access(svc),
            },
        );

        let allow_name = namer::allow_firewall_name(&spec.lb_name, scheme);
        let mut plan = FirewallPlan {
            deny_name: namer::deny_firewall_name(&allow_name),
            allow_name,
            health_check_name: namer::health_check_firewall_name(&hc_name),
            description: description.clone(),
            health_check_description: shared_description.clone(),
            scheme,
            protocol: spec.protocol.clone(),
            ports: spec.ports.clone(),
            source_ranges: utils::source_ranges(svc),
            health_check_port: spec.health_check_port,
            ip: Some(ip.clone()).filter(|ip| !ip.is_empty()),
        };

        // The IP only needs holding while the rule is created or recreated.
        let needs_hold = !ip.is_empty()
            && existing_rule.as_ref().map_or(true, |r| {
                forwarding_rule::forwarding_rule_needs_recreate(r, &desired_rule)
            });
        let mut address = needs_hold.then(|| {
            AddressManager::new(
                self.cloud.as_ref(),
                &spec.lb_name,
                &description,
                &ip,
                scheme,
                &subnetwork,
            )
        });
        let res = self
            .ensure_frontend(svc, &mut plan, &desired_rule, address.as_mut())
            .await;
        if let Some(address) = &address {
            address.release().await;
        }
        let rule = res?;

        self.delete_stale_backends(svc, existing_rule.as_ref(), &bs_name, &hc_name)
            .await?;
        info!(
            "ensured {} load balancer {} for service {} at {}",
            scheme.as_str().to_lowercase(),
            spec.lb_name,
            utils::service_key(svc),
            rule.ip_address
        );
        Ok(status_for(&rule))
    }

    pub async fn update_load_balancer(&self, svc: &Service, nodes: &[Node]) -> Result<()> {
        self.ensure_load_balancer(svc, nodes).await.map(|_| ())
    }

    /// Deletes every resource of the Service, then its finalizers. Calling it again after
    /// it succeeded does nothing.
    pub async fn ensure_load_balancer_deleted(&self, svc: &Service) -> Result<()> {
        let mut schemes: Vec<LbScheme> = [LbScheme::Internal, LbScheme::External]
            .into_iter()
            .filter(|s| utils::has_finalizer(svc, finalizer_for(*s)))
            .collect();
        match classify(svc) {
            ManagementState::Unmanaged if schemes.is_empty() => {
                return Err(Error::ImplementedElsewhere)
            }
            ManagementState::Deleted => return Ok(()),
            ManagementState::Managed(s) | ManagementState::Deleting(s) if !schemes.contains(&s) => {
                schemes.push(s)
            }
            _ => {}
        }
        for scheme in &schemes {
            self.delete_resources(svc, *scheme, true).await?;
        }
        for scheme in &schemes {
            let finalizer = finalizer_for(*scheme);
            if utils::has_finalizer(svc, finalizer) {
                self.writer.remove_finalizer(svc, finalizer).await?;
            }
        }
        info!(
            "deleted load balancer {} for service {}",
            namer::load_balancer_name(svc),
            utils::service_key(svc)
        );
        Ok(())
    }

    async fn validate(&self, svc: &Service) -> Result<LbSpec> {
        let ports = utils::service_ports(svc);
        let protocols: BTreeSet<String> = ports.iter().map(|p| utils::port_protocol(p)).collect();
        if protocols.len() > 1 {
            warn!(
                "service {} mixes protocols {:?}",
                utils::service_key(svc),
                protocols
            );
            let condition = Condition {
                type_: LB_PORTS_ERROR_CONDITION.into(),
                status: "True".into(),
                reason: MIXED_PROTOCOL_REASON.into(),
                message: MIXED_PROTOCOL_ERROR.into(),
                last_transition_time: Time(Utc::now()),
                observed_generation: svc.metadata.generation,
            };
            self.writer.set_condition(svc, condition).await?;
            self.events
                .warning(svc, MIXED_PROTOCOL_REASON, MIXED_PROTOCOL_ERROR.into())
                .await;
            return Err(Error::Validation(MIXED_PROTOCOL_ERROR.into()));
        }
        let Some(protocol) = protocols.into_iter().next() else {
            return Err(Error::Validation(format!(
                "service {} has no ports",
                utils::service_key(svc)
            )));
        };
        let has_condition = svc
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|c| c.iter().any(|c| c.type_ == LB_PORTS_ERROR_CONDITION));
        if has_condition {
            self.writer
                .remove_condition(svc, LB_PORTS_ERROR_CONDITION)
                .await?;
        }

        let local_port = utils::requests_only_local_traffic(svc)
            .then(|| utils::health_check_node_port(svc))
            .flatten();
        Ok(LbSpec {
            lb_name: namer::load_balancer_name(svc),
            protocol,
            ports: ports.iter().map(|p| p.port).collect(),
            shared: local_port.is_none(),
            health_check_port: local_port.unwrap_or(NODES_HEALTH_CHECK_PORT),
        })
    }

    /// Address, firewalls and forwarding rule. Firewalls run again once an ephemeral IP
    /// is known, so the allow rule gets its destination and the deny rule can be created.
    async fn ensure_frontend(
        &self,
        svc: &Service,
        plan: &mut FirewallPlan,
        desired: &ForwardingRule,
        address: Option<&mut AddressManager<'_>>,
    ) -> Result<ForwardingRule> {
        if let Some(address) = address {
            address.hold().await?;
        }
        self.firewalls().ensure_firewalls(svc, plan).await?;
        let rule = ForwardingRuleManager {
            cloud: self.cloud.as_ref(),
        }
        .ensure_forwarding_rule(desired)
        .await?;
        if plan.ip.as_deref() != Some(rule.ip_address.as_str()) && !rule.ip_address.is_empty() {
            debug!(
                "forwarding rule {} got ip {}, converging firewalls again",
                rule.name, rule.ip_address
            );
            plan.ip = Some(rule.ip_address.clone());
            self.firewalls().ensure_firewalls(svc, plan).await?;
        }
        Ok(rule)
    }

    /// Backend services and health checks this load balancer used before but no longer does.
    async fn delete_stale_backends(
        &self,
        svc: &Service,
        previous_rule: Option<&ForwardingRule>,
        bs_name: &str,
        hc_name: &str,
    ) -> Result<()> {
        let Some(previous) = previous_rule else {
            return Ok(());
        };
        let previous_bs = utils::resource_name(&previous.backend_service);
        if previous_bs.is_empty() || previous_bs == bs_name {
            return Ok(());
        }
        let previous_hcs: Vec<String> = found(self.cloud.get_backend_service(previous_bs).await)
            .resource("backend service", previous_bs)?
            .map(|bs| {
                bs.health_checks
                    .iter()
                    .map(|l| utils::resource_name(l).to_string())
                    .collect()
            })
            .unwrap_or_default();
        info!("deleting stale backend service {}", previous_bs);
        self.backends()
            .delete_backend_service_if_unused(previous_bs)
            .await?;
        for hc in previous_hcs.iter().filter(|hc| *hc != hc_name) {
            self.delete_health_check_and_firewall(svc, hc).await?;
        }
        Ok(())
    }

    async fn delete_health_check_and_firewall(&self, svc: &Service, hc_name: &str) -> Result<()> {
        if self.backends().delete_health_check_if_unused(hc_name).await? {
            self.firewalls()
                .delete_firewall(svc, &namer::health_check_firewall_name(hc_name))
                .await?;
        }
        Ok(())
    }

    /// Tears down one flavour. Instance groups are shared by both flavours and only go
    /// when `delete_instance_groups` is set and the flavour is internal.
    async fn delete_resources(
        &self,
        svc: &Service,
        scheme: LbScheme,
        delete_instance_groups: bool,
    ) -> Result<()> {
        let lb_name = namer::load_balancer_name(svc);
        let cluster_id = &self.config.cluster_id;
        info!(
            "deleting {} load balancer {} for service {}",
            scheme.as_str().to_lowercase(),
            lb_name,
            utils::service_key(svc)
        );

        let rule = found(self.cloud.get_forwarding_rule(&lb_name).await)
            .resource("forwarding rule", &lb_name)?;
        ignore_not_found(self.cloud.delete_forwarding_rule(&lb_name).await)
            .resource("forwarding rule", &lb_name)?;
        ignore_not_found(self.cloud.delete_address(&lb_name).await)
            .resource("address", &lb_name)?;

        let allow_name = namer::allow_firewall_name(&lb_name, scheme);
        self.firewalls()
            .delete_firewall(svc, &namer::deny_firewall_name(&allow_name))
            .await?;
        self.firewalls().delete_firewall(svc, &allow_name).await?;

        let protocol = utils::service_ports(svc)
            .first()
            .map(|p| utils::port_protocol(p))
            .unwrap_or_else(|| "TCP".into());
        let mut backend_services = vec![
            lb_name.clone(),
            namer::backend_service_name(
                &lb_name,
                cluster_id,
                true,
                scheme,
                &protocol,
                utils::session_affinity(svc),
            ),
        ];
        if let Some(rule) = &rule {
            backend_services.push(utils::resource_name(&rule.backend_service).to_string());
        }
        let mut seen = BTreeSet::new();
        for bs in backend_services {
            if !bs.is_empty() && seen.insert(bs.clone()) {
                self.backends().delete_backend_service_if_unused(&bs).await?;
            }
        }

        for hc in [
            namer::health_check_name(&lb_name, cluster_id, false, scheme),
            namer::health_check_name(&lb_name, cluster_id, true, scheme),
        ] {
            self.delete_health_check_and_firewall(svc, &hc).await?;
        }

        if delete_instance_groups && scheme == LbScheme::Internal {
            self.instance_groups()
                .ensure_instance_groups_deleted(&namer::instance_group_name(cluster_id))
                .await?;
        }
        Ok(())
    }
}

/// The IP to keep: the one the Service asks for, else the current rule's if it is still in
/// the right subnetwork.
fn requested_ip(svc: &Service, existing: Option<&ForwardingRule>, subnetwork: &str) -> String {
    let ip = utils::load_balancer_ip(svc);
    if !ip.is_empty() {
        return ip;
    }
    match existing {
        Some(rule) if utils::links_equal(&rule.subnetwork, subnetwork) => rule.ip_address.clone(),
        _ => String::new(),
    }
}

fn status_for(rule: &ForwardingRule) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            ip: Some(rule.ip_address.clone()),
            ..Default::default()
        }]),
    }
}
