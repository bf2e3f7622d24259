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

//! Allow, health check and deny firewalls of a load balancer.
//!
//! With the deny firewall enabled, the allow and health check rules sit at priority 999
//! and the deny rule at 1000, so the deny rule only ever shadows traffic nobody asked for.
//! Rolling forward lowers the allow rules before the deny rule exists; rolling back removes
//! the deny rule before the allow rules return to 1000.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;
use log::{debug, info, warn};

use crate::config::GceConfig;
use crate::constants::{
    ALLOW_PRIORITY_WITH_DENY, ALL_IPV4_CIDR, DEFAULT_FIREWALL_PRIORITY, DENY_FIREWALL_PRIORITY,
    ILB_FIREWALL_CIDR, NLB_FIREWALL_CIDR, XPN_FIREWALL_EVENT_REASON,
};
use crate::errors::{ResourceContext, Result};
use crate::events::EventRecorder;
use crate::gce::{found, CloudCompute, Firewall, FirewallPorts, GceError, LbScheme};
use crate::utils;

/// Sorted, deduplicated ports with contiguous runs collapsed into `start-end`.
pub(crate) fn compact_port_ranges(ports: &[i32]) -> Vec<String> {
    let mut ports = ports.to_vec();
    ports.sort_unstable();
    ports.dedup();
    let mut ranges = Vec::new();
    let mut iter = ports.into_iter();
    let Some(first) = iter.next() else {
        return ranges;
    };
    let (mut start, mut end) = (first, first);
    for port in iter {
        if port == end + 1 {
            end = port;
            continue;
        }
        ranges.push(port_range(start, end));
        start = port;
        end = port;
    }
    ranges.push(port_range(start, end));
    ranges
}

fn port_range(start: i32, end: i32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

fn rule_set(rules: &[FirewallPorts]) -> BTreeSet<(String, BTreeSet<&str>)> {
    rules
        .iter()
        .map(|r| {
            (
                r.ip_protocol.to_lowercase(),
                r.ports.iter().map(String::as_str).collect(),
            )
        })
        .collect()
}

fn string_set(values: &[String]) -> BTreeSet<&str> {
    values.iter().map(String::as_str).collect()
}

pub(crate) fn firewall_needs_update(existing: &Firewall, desired: &Firewall) -> bool {
    rule_set(&existing.allowed) != rule_set(&desired.allowed)
        || rule_set(&existing.denied) != rule_set(&desired.denied)
        || string_set(&existing.source_ranges) != string_set(&desired.source_ranges)
        || string_set(&existing.destination_ranges) != string_set(&desired.destination_ranges)
        || string_set(&existing.target_tags) != string_set(&desired.target_tags)
        || existing.priority != desired.priority
        || existing.description != desired.description
}

fn only_priority_differs(existing: &Firewall, desired: &Firewall) -> bool {
    existing.priority != desired.priority
        && !firewall_needs_update(
            existing,
            &Firewall {
                priority: existing.priority,
                ..desired.clone()
            },
        )
}

/// Everything needed to build the firewalls of one load balancer.
#[derive(Clone, Debug)]
pub(crate) struct FirewallPlan {
    pub allow_name: String,
    pub deny_name: String,
    pub health_check_name: String,
    pub description: String,
    pub health_check_description: String,
    pub scheme: LbScheme,
    pub protocol: String,
    pub ports: Vec<i32>,
    pub source_ranges: Vec<String>,
    pub health_check_port: i32,
    /// Forwarding rule IP, unknown until the first forwarding rule gets an ephemeral one.
    pub ip: Option<String>,
}

impl FirewallPlan {
    fn base(&self, config: &GceConfig, name: &str, description: &str, priority: i32) -> Firewall {
        Firewall {
            name: name.to_string(),
            description: description.to_string(),
            network: config.network_url.clone(),
            direction: "INGRESS".into(),
            priority,
            target_tags: config.node_tags.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn allow_rule(&self, config: &GceConfig, priority: i32) -> Firewall {
        Firewall {
            allowed: vec![FirewallPorts {
                ip_protocol: self.protocol.to_lowercase(),
                ports: compact_port_ranges(&self.ports),
            }],
            source_ranges: self.source_ranges.clone(),
            destination_ranges: self.ip.iter().cloned().collect(),
            ..self.base(config, &self.allow_name, &self.description, priority)
        }
    }

    pub(crate) fn health_check_rule(&self, config: &GceConfig, priority: i32) -> Firewall {
        let cidrs = match self.scheme {
            LbScheme::Internal => ILB_FIREWALL_CIDR,
            LbScheme::External => NLB_FIREWALL_CIDR,
        };
        Firewall {
            allowed: vec![FirewallPorts {
                ip_protocol: "tcp".into(),
                ports: vec![self.health_check_port.to_string()],
            }],
            source_ranges: cidrs.split(',').map(String::from).collect(),
            ..self.base(
                config,
                &self.health_check_name,
                &self.health_check_description,
                priority,
            )
        }
    }

    pub(crate) fn deny_rule(&self, config: &GceConfig, ip: &str) -> Firewall {
        Firewall {
            denied: vec![FirewallPorts {
                ip_protocol: "all".into(),
                ports: vec![],
            }],
            source_ranges: vec![ALL_IPV4_CIDR.into()],
            destination_ranges: vec![ip.to_string()],
            ..self.base(
                config,
                &self.deny_name,
                &self.description,
                DENY_FIREWALL_PRIORITY,
            )
        }
    }
}

/// Result of a firewall write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Converged,
    /// The network belongs to a host project we may not write to; a security admin has to
    /// apply the change.
    NeedsSecurityAdmin,
}

pub(crate) struct FirewallManager<'a> {
    pub cloud: &'a dyn CloudCompute,
    pub config: &'a GceConfig,
    pub events: &'a dyn EventRecorder,
}

impl FirewallManager<'_> {
    /// Converges all firewalls of `plan`, including the deny rule choreography.
    pub(crate) async fn ensure_firewalls(&self, svc: &Service, plan: &FirewallPlan) -> Result<()> {
        if self.config.enable_deny_firewall {
            let allow = self
                .ensure_firewall(svc, plan.allow_rule(self.config, ALLOW_PRIORITY_WITH_DENY))
                .await?;
            let hc = self
                .ensure_firewall(
                    svc,
                    plan.health_check_rule(self.config, ALLOW_PRIORITY_WITH_DENY),
                )
                .await?;
            match &plan.ip {
                Some(ip) if allow == Outcome::Converged && hc == Outcome::Converged => {
                    self.ensure_firewall(svc, plan.deny_rule(self.config, ip))
                        .await?;
                }
                Some(_) => warn!(
                    "not creating deny firewall {}: allow firewalls await a security admin",
                    plan.deny_name
                ),
                None => debug!(
                    "deny firewall {} deferred until the forwarding rule ip is known",
                    plan.deny_name
                ),
            }
            return Ok(());
        }

        let deny_gone = match found(self.cloud.get_firewall(&plan.deny_name).await)
            .resource("firewall", &plan.deny_name)?
        {
            Some(_) => {
                info!("rolling back deny firewall {}", plan.deny_name);
                self.delete_firewall(svc, &plan.deny_name).await? == Outcome::Converged
            }
            None => true,
        };
        let allow_priority = self.rollback_priority(&plan.allow_name, deny_gone).await?;
        let hc_priority = self
            .rollback_priority(&plan.health_check_name, deny_gone)
            .await?;
        self.ensure_firewall(svc, plan.allow_rule(self.config, allow_priority))
            .await?;
        self.ensure_firewall(svc, plan.health_check_rule(self.config, hc_priority))
            .await?;
        Ok(())
    }

    /// Allow priority once the deny rule is disabled. Existing priorities are kept unless the
    /// rollback cleanup flag is set and the deny rule is really gone.
    async fn rollback_priority(&self, name: &str, deny_gone: bool) -> Result<i32> {
        if deny_gone && self.config.deny_firewall_rollback_cleanup {
            return Ok(DEFAULT_FIREWALL_PRIORITY);
        }
        let existing = found(self.cloud.get_firewall(name).await).resource("firewall", name)?;
        Ok(existing
            .map(|fw| fw.priority)
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_FIREWALL_PRIORITY))
    }

    pub(crate) async fn ensure_firewall(
        &self,
        svc: &Service,
        desired: Firewall,
    ) -> Result<Outcome> {
        let name = desired.name.clone();
        let existing = found(self.cloud.get_firewall(&name).await).resource("firewall", &name)?;
        let (op, res) = match existing {
            None => {
                info!("creating firewall {} for service {}", name, utils::service_key(svc));
                ("create", self.cloud.insert_firewall(&desired).await)
            }
            Some(existing) if only_priority_differs(&existing, &desired) => {
                info!(
                    "changing priority of firewall {} from {} to {}",
                    name, existing.priority, desired.priority
                );
                ("update", self.cloud.patch_firewall(&desired).await)
            }
            Some(existing) if firewall_needs_update(&existing, &desired) => {
                info!("updating firewall {} for service {}", name, utils::service_key(svc));
                ("update", self.cloud.update_firewall(&desired).await)
            }
            Some(_) => {
                debug!("firewall {} is up to date", name);
                return Ok(Outcome::Converged);
            }
        };
        self.tolerate_xpn(svc, res, op, &desired)
            .await
            .resource("firewall", &name)
    }

    pub(crate) async fn delete_firewall(&self, svc: &Service, name: &str) -> Result<Outcome> {
        let res = match self.cloud.delete_firewall(name).await {
            Err(e) if e.is_not_found() => return Ok(Outcome::Converged),
            res => res,
        };
        if res.is_ok() {
            info!("deleted firewall {}", name);
        }
        let stub = Firewall {
            name: name.to_string(),
            ..Default::default()
        };
        self.tolerate_xpn(svc, res, "delete", &stub)
            .await
            .resource("firewall", name)
    }

    /// A 403 in a shared VPC becomes an event telling the security admin what to run.
    async fn tolerate_xpn(
        &self,
        svc: &Service,
        res: std::result::Result<(), GceError>,
        op: &str,
        firewall: &Firewall,
    ) -> std::result::Result<Outcome, GceError> {
        match res {
            Ok(()) => Ok(Outcome::Converged),
            Err(e) if e.is_forbidden() && self.config.is_xpn() => {
                let command = gcloud_command(op, firewall, &self.config.network_project_id);
                warn!(
                    "firewall {} needs a security admin in project {}: {}",
                    firewall.name, self.config.network_project_id, command
                );
                self.events
                    .warning(
                        svc,
                        XPN_FIREWALL_EVENT_REASON,
                        format!("Firewall change required by security admin: `{}`", command),
                    )
                    .await;
                Ok(Outcome::NeedsSecurityAdmin)
            }
            Err(e) => Err(e),
        }
    }
}

fn rules_flag(rules: &[FirewallPorts]) -> String {
    rules
        .iter()
        .flat_map(|r| {
            if r.ports.is_empty() {
                vec![r.ip_protocol.clone()]
            } else {
                r.ports
                    .iter()
                    .map(|p| format!("{}:{}", r.ip_protocol, p))
                    .collect()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// The `gcloud` invocation equivalent to a firewall write.
pub(crate) fn gcloud_command(op: &str, firewall: &Firewall, project: &str) -> String {
    if op == "delete" {
        return format!(
            "gcloud compute firewall-rules delete {} --project {}",
            firewall.name, project
        );
    }
    let mut args = vec![format!(
        "gcloud compute firewall-rules {} {}",
        op, firewall.name
    )];
    if op == "create" {
        args.push(format!(
            "--network {} --direction INGRESS",
            utils::resource_name(&firewall.network)
        ));
    }
    if !firewall.description.is_empty() {
        args.push(format!("--description '{}'", firewall.description));
    }
    args.push(format!("--priority {}", firewall.priority));
    if !firewall.allowed.is_empty() {
        args.push(format!("--allow {}", rules_flag(&firewall.allowed)));
    }
    if !firewall.denied.is_empty() {
        args.push(format!("--rules {} --action DENY", rules_flag(&firewall.denied)));
    }
    args.push(format!("--source-ranges {}", firewall.source_ranges.join(",")));
    if !firewall.destination_ranges.is_empty() {
        args.push(format!(
            "--destination-ranges {}",
            firewall.destination_ranges.join(",")
        ));
    }
    args.push(format!("--target-tags {}", firewall.target_tags.join(",")));
    args.push(format!("--project {}", project));
    args.join(" ")
}

#[cfg(test)]
mod tests {
    use super::{
        compact_port_ranges, firewall_needs_update, gcloud_command, FirewallManager, FirewallPlan,
        Outcome,
    };
    use crate::config::test_config;
    use crate::constants::XPN_FIREWALL_EVENT_REASON;
    use crate::events::testing::RecordingEvents;
    use crate::gce::fake::{Failure, FakeCloud};
    use crate::gce::{Firewall, FirewallPorts, LbScheme};
    use crate::utils::tests::create_test_svc;
    use std::collections::BTreeMap;

    fn plan(ip: Option<&str>) -> FirewallPlan {
        FirewallPlan {
            allow_name: "k8s-fw-a1".into(),
            deny_name: "k8s-fw-a1-deny".into(),
            health_check_name: "k8s-c0ffee-node-hc".into(),
            description: r#"{"kubernetes.io/service-name":"default/test"}"#.into(),
            health_check_description: String::new(),
            scheme: LbScheme::External,
            protocol: "TCP".into(),
            ports: vec![80, 81, 443],
            source_ranges: vec!["0.0.0.0/0".into()],
            health_check_port: 10256,
            ip: ip.map(String::from),
        }
    }

    #[test]
    pub fn compact_port_ranges_coalesces_runs() {
        assert_eq!(
            compact_port_ranges(&[8, 66, 23, 13, 89]),
            vec!["8", "13", "23", "66", "89"]
        );
        assert_eq!(
            compact_port_ranges(&[18, 19, 20, 21, 22, 55, 56]),
            vec!["18-22", "55-56"]
        );
        assert_eq!(compact_port_ranges(&[10, 10, 10]), vec!["10"]);
        assert_eq!(compact_port_ranges(&[]), Vec::<String>::new());
    }

    #[test]
    pub fn firewall_needs_update_ignores_ordering() {
        let config = test_config();
        let desired = plan(Some("34.1.1.1")).allow_rule(&config, 1000);
        let mut existing = desired.clone();
        existing.source_ranges.reverse();
        existing.self_link = "projects/test-project/global/firewalls/k8s-fw-a1".into();
        assert!(!firewall_needs_update(&existing, &desired));

        existing.priority = 999;
        assert!(firewall_needs_update(&existing, &desired));

        let mut other_ports = desired.clone();
        other_ports.allowed = vec![FirewallPorts {
            ip_protocol: "tcp".into(),
            ports: vec!["80".into()],
        }];
        assert!(firewall_needs_update(&other_ports, &desired));
    }

    #[test]
    pub fn allow_rule_uses_compacted_ports_and_known_ip() {
        let config = test_config();
        let rule = plan(Some("34.1.1.1")).allow_rule(&config, 999);
        assert_eq!(rule.allowed[0].ports, vec!["80-81", "443"]);
        assert_eq!(rule.allowed[0].ip_protocol, "tcp");
        assert_eq!(rule.destination_ranges, vec!["34.1.1.1"]);
        assert_eq!(rule.target_tags, vec!["gke-node"]);
        assert_eq!(rule.priority, 999);
        assert!(plan(None).allow_rule(&config, 1000).destination_ranges.is_empty());

        let hc = plan(None).health_check_rule(&config, 1000);
        assert_eq!(
            hc.source_ranges,
            vec!["35.191.0.0/16", "209.85.152.0/22", "209.85.204.0/22"]
        );
        assert_eq!(hc.allowed[0].ports, vec!["10256"]);
    }

    #[tokio::test]
    pub async fn deny_firewall_roll_forward_and_back() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let mut config = test_config();
        let plan = plan(Some("34.1.1.1"));

        let fwm = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        };
        fwm.ensure_firewalls(&svc, &plan).await.unwrap();
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 1000);
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());

        config.enable_deny_firewall = true;
        let fwm = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        };
        fwm.ensure_firewalls(&svc, &plan).await.unwrap();
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 999);
        assert_eq!(cloud.firewall("k8s-c0ffee-node-hc").unwrap().priority, 999);
        let deny = cloud.firewall("k8s-fw-a1-deny").unwrap();
        assert_eq!(deny.priority, 1000);
        assert_eq!(deny.destination_ranges, vec!["34.1.1.1"]);

        config.enable_deny_firewall = false;
        let fwm = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        };
        fwm.ensure_firewalls(&svc, &plan).await.unwrap();
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 1000);

        // Every intermediate state keeps allow strictly ahead of deny.
        for snapshot in cloud.firewall_history() {
            if let Some(deny) = snapshot.get("k8s-fw-a1-deny") {
                let allow = snapshot.get("k8s-fw-a1").unwrap();
                assert!(allow.priority < deny.priority, "{:?}", snapshot);
            }
        }
    }

    #[tokio::test]
    pub async fn rollback_without_cleanup_keeps_allow_priority() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let mut config = test_config();
        config.enable_deny_firewall = true;
        config.deny_firewall_rollback_cleanup = false;
        let plan = plan(Some("34.1.1.1"));
        FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        }
        .ensure_firewalls(&svc, &plan)
        .await
        .unwrap();

        config.enable_deny_firewall = false;
        FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        }
        .ensure_firewalls(&svc, &plan)
        .await
        .unwrap();
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 999);
    }

    #[tokio::test]
    pub async fn deny_firewall_waits_for_the_ip() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let mut config = test_config();
        config.enable_deny_firewall = true;
        FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        }
        .ensure_firewalls(&svc, &plan(None))
        .await
        .unwrap();
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 999);
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());
    }

    #[tokio::test]
    pub async fn failed_allow_update_never_creates_deny() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let mut config = test_config();
        config.enable_deny_firewall = true;
        cloud.fail("insert_firewall", "k8s-c0ffee-node-hc", Failure::Unavailable);
        let res = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        }
        .ensure_firewalls(&svc, &plan(Some("34.1.1.1")))
        .await;
        assert!(res.is_err());
        assert_eq!(cloud.firewall("k8s-fw-a1").unwrap().priority, 999);
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());
    }

    #[tokio::test]
    pub async fn forbidden_writes_in_shared_vpc_emit_an_event() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let mut config = test_config();
        config.network_project_id = "host-project".into();
        config.enable_deny_firewall = true;
        cloud.fail("insert_firewall", "k8s-fw-a1", Failure::Forbidden);
        let fwm = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        };
        fwm.ensure_firewalls(&svc, &plan(Some("34.1.1.1")))
            .await
            .unwrap();
        let recorded = events.with_reason(XPN_FIREWALL_EVENT_REASON);
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].warning);
        assert!(recorded[0]
            .note
            .contains("gcloud compute firewall-rules create k8s-fw-a1"));
        assert!(recorded[0].note.contains("--project host-project"));
        assert!(cloud.firewall("k8s-fw-a1").is_none());
        assert!(cloud.firewall("k8s-fw-a1-deny").is_none());
    }

    #[tokio::test]
    pub async fn forbidden_outside_shared_vpc_is_an_error() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let config = test_config();
        cloud.fail("insert_firewall", "k8s-fw-a1", Failure::Forbidden);
        let outcome = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        }
        .ensure_firewall(&svc, plan(None).allow_rule(&config, 1000))
        .await;
        assert!(outcome.is_err());
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    pub async fn delete_firewall_tolerates_missing_rules() {
        let cloud = FakeCloud::new("test-project", "us-central1");
        let events = RecordingEvents::default();
        let svc = create_test_svc(&BTreeMap::new());
        let config = test_config();
        let fwm = FirewallManager {
            cloud: &cloud,
            config: &config,
            events: &events,
        };
        assert_eq!(
            fwm.delete_firewall(&svc, "missing").await.unwrap(),
            Outcome::Converged
        );
        assert_eq!(cloud.write_count(), 0);
    }

    #[test]
    pub fn gcloud_command_for_deny_rule() {
        let config = test_config();
        let deny = plan(Some("34.1.1.1")).deny_rule(&config, "34.1.1.1");
        let command = gcloud_command("create", &deny, "host");
        assert!(command.starts_with("gcloud compute firewall-rules create k8s-fw-a1-deny"));
        assert!(command.contains("--rules all --action DENY"));
        assert!(command.contains("--destination-ranges 34.1.1.1"));
        let delete = gcloud_command(
            "delete",
            &Firewall {
                name: "k8s-fw-a1".into(),
                ..Default::default()
            },
            "host",
        );
        assert_eq!(
            delete,
            "gcloud compute firewall-rules delete k8s-fw-a1 --project host"
        );
    }
}
