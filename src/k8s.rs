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

//! Writes to the Service object: finalizers, conditions and load balancer status.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use log::debug;
use serde_json::json;

use crate::errors::{Error, Result};
use crate::utils;

#[async_trait]
pub trait ServiceWriter: Send + Sync {
    async fn add_finalizer(&self, svc: &Service, finalizer: &str) -> Result<()>;
    async fn remove_finalizer(&self, svc: &Service, finalizer: &str) -> Result<()>;
    /// Adds `condition` or replaces the one with the same type.
    async fn set_condition(&self, svc: &Service, condition: Condition) -> Result<()>;
    async fn remove_condition(&self, svc: &Service, type_: &str) -> Result<()>;
    async fn update_load_balancer_status(
        &self,
        svc: &Service,
        status: LoadBalancerStatus,
    ) -> Result<()>;
    async fn reset_load_balancer_status(&self, svc: &Service) -> Result<()>;
}

pub struct KubeServiceWriter {
    client: Client,
}

impl KubeServiceWriter {
    pub fn new(client: Client) -> Self {
        KubeServiceWriter { client }
    }

    fn api(&self, svc: &Service) -> Api<Service> {
        Api::namespaced(self.client.clone(), &svc.namespace().unwrap_or_default())
    }

    /// Rewrites the finalizer list of the latest version of the Service.
    ///
    /// The patch carries the resourceVersion it was computed from, so a concurrent
    /// change makes the API server reject it with a conflict instead of losing a finalizer.
    async fn patch_finalizers<F>(&self, svc: &Service, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>) -> bool + Send,
    {
        let api = self.api(svc);
        let name = svc.name_any();
        let Some(latest) = api.get_opt(&name).await? else {
            return Ok(());
        };
        let mut finalizers = latest.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(());
        }
        let data = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": latest.resource_version(),
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(data))
            .await
            .map_err(|e| {
                Error::FinalizerError(format!(
                    "failed to update finalizers for service {}: {}",
                    utils::service_key(svc),
                    e
                ))
            })?;
        Ok(())
    }

    async fn patch_conditions<F>(&self, svc: &Service, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Condition>) -> bool + Send,
    {
        let api = self.api(svc);
        let name = svc.name_any();
        let Some(latest) = api.get_opt(&name).await? else {
            return Ok(());
        };
        let mut conditions = latest
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default();
        if !edit(&mut conditions) {
            return Ok(());
        }
        let data = json!({"status": {"conditions": conditions}});
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(data))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceWriter for KubeServiceWriter {
    async fn add_finalizer(&self, svc: &Service, finalizer: &str) -> Result<()> {
        self.patch_finalizers(svc, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await?;
        debug!(
            "added finalizer {} to service {}",
            finalizer,
            utils::service_key(svc)
        );
        Ok(())
    }

    async fn remove_finalizer(&self, svc: &Service, finalizer: &str) -> Result<()> {
        self.patch_finalizers(svc, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await?;
        debug!(
            "removed finalizer {} from service {}",
            finalizer,
            utils::service_key(svc)
        );
        Ok(())
    }

    async fn set_condition(&self, svc: &Service, condition: Condition) -> Result<()> {
        self.patch_conditions(svc, |conditions| {
            match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
                Some(existing) => {
                    if existing.status == condition.status
                        && existing.reason == condition.reason
                        && existing.message == condition.message
                    {
                        return false;
                    }
                    *existing = condition;
                }
                None => conditions.push(condition),
            }
            true
        })
        .await
    }

    async fn remove_condition(&self, svc: &Service, type_: &str) -> Result<()> {
        self.patch_conditions(svc, |conditions| {
            let before = conditions.len();
            conditions.retain(|c| c.type_ != type_);
            conditions.len() != before
        })
        .await
    }

    async fn update_load_balancer_status(
        &self,
        svc: &Service,
        status: LoadBalancerStatus,
    ) -> Result<()> {
        let current = svc.status.as_ref().and_then(|s| s.load_balancer.as_ref());
        if current == Some(&status) {
            return Ok(());
        }
        let data = json!({"status": {"loadBalancer": status}});
        let updated = self
            .api(svc)
            .patch_status(&svc.name_any(), &PatchParams::default(), &Patch::Merge(data))
            .await?;
        debug!(
            "updated lb status for service {}: {:?}",
            utils::service_key(svc),
            updated.status.and_then(|s| s.load_balancer)
        );
        Ok(())
    }

    async fn reset_load_balancer_status(&self, svc: &Service) -> Result<()> {
        let has_ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .is_some_and(|ingress| !ingress.is_empty());
        if !has_ingress {
            return Ok(());
        }
        let data = json!({"status": {"loadBalancer": {"ingress": null}}});
        self.api(svc)
            .patch_status(&svc.name_any(), &PatchParams::default(), &Patch::Merge(data))
            .await?;
        debug!("lb status reset for service {}", utils::service_key(svc));
        Ok(())
    }
}
