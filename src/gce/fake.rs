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

//! In-memory compute API for tests.
//!
//! Mirrors the error behaviour the engine relies on: not-found for missing resources,
//! already-exists on duplicate inserts, in-use when deleting something still referenced.
//! Every successful write is counted, and a copy of all firewalls is kept after each
//! firewall write so tests can inspect every intermediate state.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use super::{
    Address, Addresses, BackendService, BackendServices, Firewall, Firewalls, ForwardingRule,
    ForwardingRules, GceError, HealthCheck, HealthChecks, InstanceGroup, InstanceGroups,
};
use crate::utils;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Failure {
    Forbidden,
    Unavailable,
}

impl Failure {
    fn to_error(self, what: &str) -> GceError {
        match self {
            Failure::Forbidden => GceError::Forbidden(what.to_string()),
            Failure::Unavailable => GceError::Api {
                status: 503,
                message: format!("{} unavailable", what),
            },
        }
    }
}

#[derive(Default)]
struct Inner {
    forwarding_rules: BTreeMap<String, ForwardingRule>,
    firewalls: BTreeMap<String, Firewall>,
    backend_services: BTreeMap<String, BackendService>,
    health_checks: BTreeMap<String, HealthCheck>,
    instance_groups: BTreeMap<(String, String), (InstanceGroup, BTreeSet<String>)>,
    addresses: BTreeMap<String, Address>,
    failures: HashMap<String, Failure>,
    writes: Vec<String>,
    firewall_history: Vec<BTreeMap<String, Firewall>>,
    next_ip: u8,
}

pub(crate) struct FakeCloud {
    project: String,
    region: String,
    inner: Mutex<Inner>,
}

impl FakeCloud {
    pub(crate) fn new(project: &str, region: &str) -> Self {
        FakeCloud {
            project: project.to_string(),
            region: region.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes `op` on `name` fail until [`FakeCloud::clear_failures`] is called.
    pub(crate) fn fail(&self, op: &str, name: &str, failure: Failure) {
        self.lock()
            .failures
            .insert(format!("{}:{}", op, name), failure);
    }

    pub(crate) fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub(crate) fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub(crate) fn forwarding_rule(&self, name: &str) -> Option<ForwardingRule> {
        self.lock().forwarding_rules.get(name).cloned()
    }

    pub(crate) fn firewall(&self, name: &str) -> Option<Firewall> {
        self.lock().firewalls.get(name).cloned()
    }

    pub(crate) fn firewall_history(&self) -> Vec<BTreeMap<String, Firewall>> {
        self.lock().firewall_history.clone()
    }

    pub(crate) fn backend_service(&self, name: &str) -> Option<BackendService> {
        self.lock().backend_services.get(name).cloned()
    }

    pub(crate) fn health_check(&self, name: &str) -> Option<HealthCheck> {
        self.lock().health_checks.get(name).cloned()
    }

    pub(crate) fn address(&self, name: &str) -> Option<Address> {
        self.lock().addresses.get(name).cloned()
    }

    pub(crate) fn put_health_check(&self, hc: HealthCheck) {
        self.lock().health_checks.insert(hc.name.clone(), hc);
    }

    pub(crate) fn put_address(&self, mut address: Address) {
        address.self_link = utils::build_address_url(&self.project, &self.region, &address.name);
        self.lock().addresses.insert(address.name.clone(), address);
    }

    /// Seeds an instance group, e.g. one created outside the controller.
    pub(crate) fn put_instance_group(&self, zone: &str, name: &str, members: &[&str]) {
        let ig = InstanceGroup {
            name: name.to_string(),
            zone: zone.to_string(),
            self_link: utils::build_zonal_instance_group_url(&self.project, zone, name),
            ..Default::default()
        };
        let members = members.iter().map(|m| m.to_string()).collect();
        self.lock()
            .instance_groups
            .insert((zone.to_string(), name.to_string()), (ig, members));
    }

    pub(crate) fn instance_group_members(&self, zone: &str, name: &str) -> Option<Vec<String>> {
        self.lock()
            .instance_groups
            .get(&(zone.to_string(), name.to_string()))
            .map(|(_, members)| members.iter().cloned().collect())
    }

    pub(crate) fn instance_group_names(&self, zone: &str) -> Vec<String> {
        self.lock()
            .instance_groups
            .keys()
            .filter(|(z, _)| z == zone)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Total count of managed resources of every kind.
    pub(crate) fn resource_count(&self) -> usize {
        let inner = self.lock();
        inner.forwarding_rules.len()
            + inner.firewalls.len()
            + inner.backend_services.len()
            + inner.health_checks.len()
            + inner.instance_groups.len()
            + inner.addresses.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn check(&self, inner: &Inner, op: &str, name: &str) -> Result<(), GceError> {
        match inner.failures.get(&format!("{}:{}", op, name)) {
            Some(failure) => Err(failure.to_error(&format!("{} {}", op, name))),
            None => Ok(()),
        }
    }

    fn record_write(inner: &mut Inner, op: &str, name: &str) {
        inner.writes.push(format!("{}:{}", op, name));
        if op.ends_with("_firewall") {
            let snapshot = inner.firewalls.clone();
            inner.firewall_history.push(snapshot);
        }
    }
}

fn not_found(kind: &str, name: &str) -> GceError {
    GceError::NotFound(format!("{} {}", kind, name))
}

fn in_use(kind: &str, name: &str, by: &str) -> GceError {
    GceError::InUse(format!("{} {} is used by {}", kind, name, by))
}

#[async_trait]
impl ForwardingRules for FakeCloud {
    async fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule, GceError> {
        let inner = self.lock();
        self.check(&inner, "get_forwarding_rule", name)?;
        inner
            .forwarding_rules
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("forwarding rule", name))
    }

    async fn insert_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "insert_forwarding_rule", &rule.name)?;
        if inner.forwarding_rules.contains_key(&rule.name) {
            return Err(GceError::AlreadyExists(rule.name.clone()));
        }
        let mut rule = rule.clone();
        if rule.ip_address.is_empty() {
            inner.next_ip += 1;
            rule.ip_address = match rule.load_balancing_scheme.as_str() {
                "INTERNAL" => format!("10.128.0.{}", inner.next_ip),
                _ => format!("34.120.0.{}", inner.next_ip),
            };
        }
        rule.self_link = utils::build_forwarding_rule_url(&self.project, &self.region, &rule.name);
        Self::record_write(&mut inner, "insert_forwarding_rule", &rule.name);
        inner.forwarding_rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    async fn patch_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "patch_forwarding_rule", &rule.name)?;
        let existing = inner
            .forwarding_rules
            .get_mut(&rule.name)
            .ok_or_else(|| not_found("forwarding rule", &rule.name))?;
        existing.allow_global_access = rule.allow_global_access;
        Self::record_write(&mut inner, "patch_forwarding_rule", &rule.name);
        Ok(())
    }

    async fn delete_forwarding_rule(&self, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_forwarding_rule", name)?;
        inner
            .forwarding_rules
            .remove(name)
            .ok_or_else(|| not_found("forwarding rule", name))?;
        Self::record_write(&mut inner, "delete_forwarding_rule", name);
        Ok(())
    }
}

#[async_trait]
impl Firewalls for FakeCloud {
    async fn get_firewall(&self, name: &str) -> Result<Firewall, GceError> {
        let inner = self.lock();
        self.check(&inner, "get_firewall", name)?;
        inner
            .firewalls
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("firewall", name))
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "insert_firewall", &firewall.name)?;
        if inner.firewalls.contains_key(&firewall.name) {
            return Err(GceError::AlreadyExists(firewall.name.clone()));
        }
        let mut firewall = firewall.clone();
        firewall.self_link = utils::build_firewall_url(&self.project, &firewall.name);
        let name = firewall.name.clone();
        inner.firewalls.insert(name.clone(), firewall);
        Self::record_write(&mut inner, "insert_firewall", &name);
        Ok(())
    }

    async fn update_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "update_firewall", &firewall.name)?;
        let existing = inner
            .firewalls
            .get_mut(&firewall.name)
            .ok_or_else(|| not_found("firewall", &firewall.name))?;
        let self_link = existing.self_link.clone();
        *existing = firewall.clone();
        existing.self_link = self_link;
        Self::record_write(&mut inner, "update_firewall", &firewall.name);
        Ok(())
    }

    async fn patch_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "patch_firewall", &firewall.name)?;
        let existing = inner
            .firewalls
            .get_mut(&firewall.name)
            .ok_or_else(|| not_found("firewall", &firewall.name))?;
        let self_link = existing.self_link.clone();
        *existing = firewall.clone();
        existing.self_link = self_link;
        Self::record_write(&mut inner, "patch_firewall", &firewall.name);
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_firewall", name)?;
        inner
            .firewalls
            .remove(name)
            .ok_or_else(|| not_found("firewall", name))?;
        Self::record_write(&mut inner, "delete_firewall", name);
        Ok(())
    }
}

#[async_trait]
impl BackendServices for FakeCloud {
    async fn get_backend_service(&self, name: &str) -> Result<BackendService, GceError> {
        let inner = self.lock();
        self.check(&inner, "get_backend_service", name)?;
        inner
            .backend_services
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("backend service", name))
    }

    async fn insert_backend_service(&self, bs: &BackendService) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "insert_backend_service", &bs.name)?;
        if inner.backend_services.contains_key(&bs.name) {
            return Err(GceError::AlreadyExists(bs.name.clone()));
        }
        let mut bs = bs.clone();
        bs.self_link = utils::build_backend_svc_url(&self.project, &self.region, &bs.name);
        Self::record_write(&mut inner, "insert_backend_service", &bs.name);
        inner.backend_services.insert(bs.name.clone(), bs);
        Ok(())
    }

    async fn update_backend_service(&self, bs: &BackendService) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "update_backend_service", &bs.name)?;
        let existing = inner
            .backend_services
            .get_mut(&bs.name)
            .ok_or_else(|| not_found("backend service", &bs.name))?;
        let self_link = existing.self_link.clone();
        *existing = bs.clone();
        existing.self_link = self_link;
        Self::record_write(&mut inner, "update_backend_service", &bs.name);
        Ok(())
    }

    async fn delete_backend_service(&self, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_backend_service", name)?;
        if !inner.backend_services.contains_key(name) {
            return Err(not_found("backend service", name));
        }
        if let Some(rule) = inner
            .forwarding_rules
            .values()
            .find(|r| utils::resource_name(&r.backend_service) == name)
        {
            return Err(in_use("backend service", name, &rule.name));
        }
        inner.backend_services.remove(name);
        Self::record_write(&mut inner, "delete_backend_service", name);
        Ok(())
    }
}

#[async_trait]
impl HealthChecks for FakeCloud {
    async fn get_health_check(&self, name: &str) -> Result<HealthCheck, GceError> {
        let inner = self.lock();
        self.check(&inner, "get_health_check", name)?;
        inner
            .health_checks
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("health check", name))
    }

    async fn insert_health_check(&self, hc: &HealthCheck) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "insert_health_check", &hc.name)?;
        if inner.health_checks.contains_key(&hc.name) {
            return Err(GceError::AlreadyExists(hc.name.clone()));
        }
        let mut hc = hc.clone();
        hc.self_link = utils::build_health_check_url(&self.project, &self.region, &hc.name);
        Self::record_write(&mut inner, "insert_health_check", &hc.name);
        inner.health_checks.insert(hc.name.clone(), hc);
        Ok(())
    }

    async fn update_health_check(&self, hc: &HealthCheck) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "update_health_check", &hc.name)?;
        let existing = inner
            .health_checks
            .get_mut(&hc.name)
            .ok_or_else(|| not_found("health check", &hc.name))?;
        let self_link = existing.self_link.clone();
        *existing = hc.clone();
        existing.self_link = self_link;
        Self::record_write(&mut inner, "update_health_check", &hc.name);
        Ok(())
    }

    async fn delete_health_check(&self, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_health_check", name)?;
        if !inner.health_checks.contains_key(name) {
            return Err(not_found("health check", name));
        }
        if let Some(bs) = inner.backend_services.values().find(|bs| {
            bs.health_checks
                .iter()
                .any(|link| utils::resource_name(link) == name)
        }) {
            return Err(in_use("health check", name, &bs.name));
        }
        inner.health_checks.remove(name);
        Self::record_write(&mut inner, "delete_health_check", name);
        Ok(())
    }
}

#[async_trait]
impl InstanceGroups for FakeCloud {
    async fn list_instance_groups(&self, zone: &str) -> Result<Vec<InstanceGroup>, GceError> {
        let inner = self.lock();
        self.check(&inner, "list_instance_groups", zone)?;
        Ok(inner
            .instance_groups
            .iter()
            .filter(|((z, _), _)| z == zone)
            .map(|(_, (ig, _))| ig.clone())
            .collect())
    }

    async fn insert_instance_group(&self, zone: &str, ig: &InstanceGroup) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "insert_instance_group", &ig.name)?;
        let key = (zone.to_string(), ig.name.clone());
        if inner.instance_groups.contains_key(&key) {
            return Err(GceError::AlreadyExists(ig.name.clone()));
        }
        let mut ig = ig.clone();
        ig.zone = zone.to_string();
        ig.self_link = utils::build_zonal_instance_group_url(&self.project, zone, &ig.name);
        Self::record_write(&mut inner, "insert_instance_group", &ig.name);
        inner.instance_groups.insert(key, (ig, BTreeSet::new()));
        Ok(())
    }

    async fn delete_instance_group(&self, zone: &str, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_instance_group", name)?;
        let key = (zone.to_string(), name.to_string());
        let Some((ig, _)) = inner.instance_groups.get(&key) else {
            return Err(not_found("instance group", name));
        };
        let link = ig.self_link.clone();
        if let Some(bs) = inner.backend_services.values().find(|bs| {
            bs.backends
                .iter()
                .any(|b| utils::links_equal(&b.group, &link))
        }) {
            return Err(in_use("instance group", name, &bs.name));
        }
        inner.instance_groups.remove(&key);
        Self::record_write(&mut inner, "delete_instance_group", name);
        Ok(())
    }

    async fn list_instances(&self, zone: &str, name: &str) -> Result<Vec<String>, GceError> {
        let inner = self.lock();
        self.check(&inner, "list_instances", name)?;
        let (_, members) = inner
            .instance_groups
            .get(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| not_found("instance group", name))?;
        Ok(members
            .iter()
            .map(|m| {
                format!(
                    "https://www.googleapis.com/compute/v1/{}",
                    utils::build_instance_url(&self.project, zone, m)
                )
            })
            .collect())
    }

    async fn add_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "add_instances", name)?;
        let (_, members) = inner
            .instance_groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| not_found("instance group", name))?;
        members.extend(instances.iter().cloned());
        Self::record_write(&mut inner, "add_instances", name);
        Ok(())
    }

    async fn remove_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "remove_instances", name)?;
        let (_, members) = inner
            .instance_groups
            .get_mut(&(zone.to_string(), name.to_string()))
            .ok_or_else(|| not_found("instance group", name))?;
        for instance in instances {
            members.remove(instance);
        }
        Self::record_write(&mut inner, "remove_instances", name);
        Ok(())
    }
}

#[async_trait]
impl Addresses for FakeCloud {
    async fn get_address(&self, name: &str) -> Result<Address, GceError> {
        let inner = self.lock();
        self.check(&inner, "get_address", name)?;
        inner
            .addresses
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("address", name))
    }

    async fn list_addresses(&self) -> Result<Vec<Address>, GceError> {
        let inner = self.lock();
        Ok(inner.addresses.values().cloned().collect())
    }

    async fn reserve_address(&self, address: &Address) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "reserve_address", &address.name)?;
        if inner.addresses.contains_key(&address.name) {
            return Err(GceError::AlreadyExists(address.name.clone()));
        }
        let mut address = address.clone();
        address.self_link = utils::build_address_url(&self.project, &self.region, &address.name);
        Self::record_write(&mut inner, "reserve_address", &address.name);
        inner.addresses.insert(address.name.clone(), address);
        Ok(())
    }

    async fn delete_address(&self, name: &str) -> Result<(), GceError> {
        let mut inner = self.lock();
        self.check(&inner, "delete_address", name)?;
        inner
            .addresses
            .remove(name)
            .ok_or_else(|| not_found("address", name))?;
        Self::record_write(&mut inner, "delete_address", name);
        Ok(())
    }
}
