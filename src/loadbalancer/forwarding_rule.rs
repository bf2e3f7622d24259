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

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::config::GceConfig;
use crate::constants::MAX_L4_PORTS;
use crate::errors::{ResourceContext, Result};
use crate::gce::{found, Address, CloudCompute, ForwardingRule, LbScheme};
use crate::utils;

/// Rule ports: explicit up to [`MAX_L4_PORTS`] distinct ports, otherwise all ports.
pub(crate) fn rule_ports(ports: &[i32]) -> (Vec<String>, bool) {
    let distinct: BTreeSet<i32> = ports.iter().copied().collect();
    if distinct.len() > MAX_L4_PORTS {
        return (vec![], true);
    }
    (distinct.iter().map(i32::to_string).collect(), false)
}

pub(crate) struct RuleParams<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub scheme: LbScheme,
    pub protocol: &'a str,
    pub ports: &'a [i32],
    pub ip: &'a str,
    pub backend_service: &'a str,
    /// Internal rules only.
    pub subnetwork: &'a str,
    pub allow_global_access: bool,
}

pub(crate) fn desired_forwarding_rule(
    config: &GceConfig,
    params: RuleParams<'_>,
) -> ForwardingRule {
    let (ports, all_ports) = rule_ports(params.ports);
    let internal = params.scheme == LbScheme::Internal;
    ForwardingRule {
        name: params.name.to_string(),
        description: params.description.to_string(),
        ip_address: params.ip.to_string(),
        ip_protocol: params.protocol.to_string(),
        ports,
        all_ports,
        load_balancing_scheme: params.scheme.as_str().to_string(),
        network: if internal {
            config.network_url.clone()
        } else {
            String::new()
        },
        subnetwork: if internal {
            params.subnetwork.to_string()
        } else {
            String::new()
        },
        backend_service: params.backend_service.to_string(),
        allow_global_access: internal && params.allow_global_access,
        ..Default::default()
    }
}

fn equal_ignoring_global_access(old: &ForwardingRule, new: &ForwardingRule) -> bool {
    let ports = |r: &ForwardingRule| r.ports.iter().cloned().collect::<BTreeSet<String>>();
    (old.ip_address.is_empty() || new.ip_address.is_empty() || old.ip_address == new.ip_address)
        && old.ip_protocol.eq_ignore_ascii_case(&new.ip_protocol)
        && old.load_balancing_scheme == new.load_balancing_scheme
        && ports(old) == ports(new)
        && old.all_ports == new.all_ports
        && utils::links_equal(&old.backend_service, &new.backend_service)
        && utils::links_equal(&old.subnetwork, &new.subnetwork)
}

/// Differences a patch can't apply.
pub(crate) fn forwarding_rule_needs_recreate(old: &ForwardingRule, new: &ForwardingRule) -> bool {
    !equal_ignoring_global_access(old, new)
}

/// An empty IP on either side matches any IP.
pub(crate) fn forwarding_rules_equal(old: &ForwardingRule, new: &ForwardingRule) -> bool {
    equal_ignoring_global_access(old, new) && old.allow_global_access == new.allow_global_access
}

pub(crate) struct ForwardingRuleManager<'a> {
    pub cloud: &'a dyn CloudCompute,
}

impl ForwardingRuleManager<'_> {
    /// Converges the rule and returns it as the API reports it, IP included.
    pub(crate) async fn ensure_forwarding_rule(
        &self,
        desired: &ForwardingRule,
    ) -> Result<ForwardingRule> {
        let name = &desired.name;
        match found(self.cloud.get_forwarding_rule(name).await)
            .resource("forwarding rule", name)?
        {
            Some(existing) if forwarding_rules_equal(&existing, desired) => {
                debug!("forwarding rule {} is up to date", name);
                return Ok(existing);
            }
            Some(existing) if equal_ignoring_global_access(&existing, desired) => {
                info!(
                    "patching global access of forwarding rule {} to {}",
                    name, desired.allow_global_access
                );
                self.cloud
                    .patch_forwarding_rule(desired)
                    .await
                    .resource("forwarding rule", name)?;
            }
            Some(_) => {
                info!("recreating forwarding rule {}", name);
                self.cloud
                    .delete_forwarding_rule(name)
                    .await
                    .resource("forwarding rule", name)?;
                self.cloud
                    .insert_forwarding_rule(desired)
                    .await
                    .resource("forwarding rule", name)?;
            }
            None => {
                info!("creating forwarding rule {}", name);
                self.cloud
                    .insert_forwarding_rule(desired)
                    .await
                    .resource("forwarding rule", name)?;
            }
        }
        self.cloud
            .get_forwarding_rule(name)
            .await
            .resource("forwarding rule", name)
    }
}

/// Holds a requested IP while its forwarding rule is created or recreated.
///
/// An address the user reserved is only adopted. Otherwise the IP is reserved under the
/// load balancer name for the duration of the reconciliation and released with
/// [`AddressManager::release`]; the forwarding rule keeps it in use after that.
pub(crate) struct AddressManager<'a> {
    cloud: &'a dyn CloudCompute,
    name: String,
    description: String,
    ip: String,
    scheme: LbScheme,
    subnetwork: String,
    reserved: bool,
}

impl<'a> AddressManager<'a> {
    pub(crate) fn new(
        cloud: &'a dyn CloudCompute,
        name: &str,
        description: &str,
        ip: &str,
        scheme: LbScheme,
        subnetwork: &str,
    ) -> Self {
        AddressManager {
            cloud,
            name: name.to_string(),
            description: description.to_string(),
            ip: ip.to_string(),
            scheme,
            subnetwork: subnetwork.to_string(),
            reserved: false,
        }
    }

    pub(crate) async fn hold(&mut self) -> Result<()> {
        match found(self.cloud.get_address(&self.name).await).resource("address", &self.name)? {
            Some(existing) if existing.address == self.ip => {
                debug!("address {} already holds {}", self.name, self.ip);
                self.reserved = true;
                return Ok(());
            }
            Some(existing) => {
                info!(
                    "deleting address {} holding {} instead of {}",
                    self.name, existing.address, self.ip
                );
                match self.cloud.delete_address(&self.name).await {
                    Err(e) if e.is_not_found() => {}
                    res => res.resource("address", &self.name)?,
                }
            }
            None => {}
        }

        let addresses = self
            .cloud
            .list_addresses()
            .await
            .resource("address", &self.ip)?;
        if let Some(user) = addresses.iter().find(|a| a.address == self.ip) {
            debug!("ip {} is reserved by address {}", self.ip, user.name);
            return Ok(());
        }

        let address = Address {
            name: self.name.clone(),
            description: self.description.clone(),
            address: self.ip.clone(),
            address_type: self.scheme.as_str().to_string(),
            subnetwork: match self.scheme {
                LbScheme::Internal => self.subnetwork.clone(),
                LbScheme::External => String::new(),
            },
            ..Default::default()
        };
        info!("reserving {} as address {}", self.ip, self.name);
        self.cloud
            .reserve_address(&address)
            .await
            .resource("address", &self.name)?;
        self.reserved = true;
        Ok(())
    }

    /// Releases a reservation made by [`AddressManager::hold`]. Errors are only logged.
    pub(crate) async fn release(&self) {
        if !self.reserved {
            return;
        }
        match self.cloud.delete_address(&self.name).await {
            Ok(()) => debug!("released address {}", self.name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to release address {}: {}", self.name, e),
        }
    }
}
