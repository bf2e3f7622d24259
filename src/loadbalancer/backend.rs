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

use log::{debug, info};

use crate::config::GceConfig;
use crate::constants::{
    HC_CHECK_INTERVAL_SEC, HC_HEALTHY_THRESHOLD, HC_REQUEST_PATH, HC_TIMEOUT_SEC,
    HC_UNHEALTHY_THRESHOLD,
};
use crate::errors::{ResourceContext, Result};
use crate::gce::{
    found, Backend, BackendService, CloudCompute, HealthCheck, HttpHealthCheck, LbScheme,
};
use crate::utils;

/// HTTP health check with the minimum intervals and thresholds.
pub(crate) fn desired_health_check(name: &str, description: &str, port: i32) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        description: description.to_string(),
        type_: "HTTP".into(),
        http_health_check: Some(HttpHealthCheck {
            port,
            request_path: HC_REQUEST_PATH.into(),
        }),
        check_interval_sec: HC_CHECK_INTERVAL_SEC,
        timeout_sec: HC_TIMEOUT_SEC,
        healthy_threshold: HC_HEALTHY_THRESHOLD,
        unhealthy_threshold: HC_UNHEALTHY_THRESHOLD,
        ..Default::default()
    }
}

/// Keeps intervals and thresholds an operator raised above the minimums.
pub(crate) fn merge_health_checks(existing: &HealthCheck, desired: &mut HealthCheck) {
    desired.check_interval_sec = desired.check_interval_sec.max(existing.check_interval_sec);
    desired.timeout_sec = desired.timeout_sec.max(existing.timeout_sec);
    desired.healthy_threshold = desired.healthy_threshold.max(existing.healthy_threshold);
    desired.unhealthy_threshold = desired
        .unhealthy_threshold
        .max(existing.unhealthy_threshold);
}

pub(crate) fn health_check_needs_update(existing: &HealthCheck, desired: &HealthCheck) -> bool {
    let (Some(current), Some(wanted)) = (&existing.http_health_check, &desired.http_health_check)
    else {
        return true;
    };
    current.port != wanted.port
        || current.request_path != wanted.request_path
        || existing.description != desired.description
        || existing.check_interval_sec < HC_CHECK_INTERVAL_SEC
        || existing.timeout_sec < HC_TIMEOUT_SEC
        || existing.healthy_threshold < HC_HEALTHY_THRESHOLD
        || existing.unhealthy_threshold < HC_UNHEALTHY_THRESHOLD
}

fn link_set(links: impl IntoIterator<Item = impl AsRef<str>>) -> BTreeSet<String> {
    links
        .into_iter()
        .map(|l| utils::resource_path(l.as_ref()).to_string())
        .collect()
}

pub(crate) fn backend_service_needs_update(
    existing: &BackendService,
    desired: &BackendService,
) -> bool {
    existing.protocol != desired.protocol
        || existing.load_balancing_scheme != desired.load_balancing_scheme
        || existing.session_affinity != desired.session_affinity
        || existing.description != desired.description
        || link_set(&existing.health_checks) != link_set(&desired.health_checks)
        || link_set(existing.backends.iter().map(|b| &b.group))
            != link_set(desired.backends.iter().map(|b| &b.group))
}

pub(crate) struct BackendServiceParams<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub protocol: &'a str,
    pub scheme: LbScheme,
    pub session_affinity: &'a str,
    pub health_check_link: &'a str,
    pub instance_groups: &'a [String],
}

pub(crate) struct BackendManager<'a> {
    pub cloud: &'a dyn CloudCompute,
    pub config: &'a GceConfig,
}

impl BackendManager<'_> {
    /// Converges a health check and returns its link.
    pub(crate) async fn ensure_health_check(
        &self,
        name: &str,
        description: &str,
        port: i32,
    ) -> Result<String> {
        let mut desired = desired_health_check(name, description, port);
        match found(self.cloud.get_health_check(name).await).resource("health check", name)? {
            None => {
                info!("creating health check {}", name);
                self.cloud
                    .insert_health_check(&desired)
                    .await
                    .resource("health check", name)?;
            }
            Some(existing) => {
                merge_health_checks(&existing, &mut desired);
                if health_check_needs_update(&existing, &desired) {
                    info!("updating health check {}", name);
                    self.cloud
                        .update_health_check(&desired)
                        .await
                        .resource("health check", name)?;
                } else {
                    debug!("health check {} is up to date", name);
                }
            }
        }
        Ok(utils::build_health_check_url(
            &self.config.project_id,
            &self.config.region,
            name,
        ))
    }

    /// Converges a backend service and returns its link. Backends are rebuilt from the
    /// instance groups on every call.
    pub(crate) async fn ensure_backend_service(
        &self,
        params: BackendServiceParams<'_>,
    ) -> Result<String> {
        let name = params.name;
        let desired = BackendService {
            name: name.to_string(),
            description: params.description.to_string(),
            protocol: params.protocol.to_string(),
            session_affinity: params.session_affinity.to_string(),
            load_balancing_scheme: params.scheme.as_str().to_string(),
            health_checks: vec![params.health_check_link.to_string()],
            backends: params
                .instance_groups
                .iter()
                .map(|group| Backend {
                    group: group.clone(),
                    balancing_mode: "CONNECTION".into(),
                })
                .collect(),
            ..Default::default()
        };
        match found(self.cloud.get_backend_service(name).await)
            .resource("backend service", name)?
        {
            None => {
                info!("creating backend service {}", name);
                self.cloud
                    .insert_backend_service(&desired)
                    .await
                    .resource("backend service", name)?;
            }
            Some(existing) if backend_service_needs_update(&existing, &desired) => {
                info!("updating backend service {}", name);
                self.cloud
                    .update_backend_service(&desired)
                    .await
                    .resource("backend service", name)?;
            }
            Some(_) => debug!("backend service {} is up to date", name),
        }
        Ok(utils::build_backend_svc_url(
            &self.config.project_id,
            &self.config.region,
            name,
        ))
    }

    /// Shared backend services stay while another forwarding rule uses them.
    pub(crate) async fn delete_backend_service_if_unused(&self, name: &str) -> Result<()> {
        match self.cloud.delete_backend_service(name).await {
            Ok(()) => info!("deleted backend service {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_in_use() => debug!("backend service {} still in use: {}", name, e),
            Err(e) => return Err(e).resource("backend service", name),
        }
        Ok(())
    }

    /// Returns whether the health check is gone, so its firewall can go too.
    pub(crate) async fn delete_health_check_if_unused(&self, name: &str) -> Result<bool> {
        match self.cloud.delete_health_check(name).await {
            Ok(()) => {
                info!("deleted health check {}", name);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) if e.is_in_use() => {
                debug!("health check {} still in use: {}", name, e);
                Ok(false)
            }
            Err(e) => Err(e).resource("health check", name),
        }
    }
}
