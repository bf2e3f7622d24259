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

//! Capability traits over the compute API, one per resource kind.
//!
//! The load balancer engine only talks to [`CloudCompute`]. [`client::ComputeClient`]
//! implements it against the REST API; tests use the in-memory `fake::FakeCloud`.

use async_trait::async_trait;
use thiserror::Error;

pub(crate) mod client;
#[cfg(test)]
pub(crate) mod fake;
pub(crate) mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum GceError {
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Returned for 403s, which in a shared VPC usually means the network belongs to another project.
    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("resource in use by another resource: {0}")]
    InUse(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("compute api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("operation {0} did not complete")]
    OperationTimeout(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to authenticate: {0}")]
    Auth(#[from] anyhow::Error),
}

impl GceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GceError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, GceError::Forbidden(_))
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, GceError::InUse(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, GceError::AlreadyExists(_))
    }
}

/// Maps a not-found error to `None`.
pub(crate) fn found<T>(res: Result<T, GceError>) -> Result<Option<T>, GceError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes that hit an already-absent resource count as done.
pub(crate) fn ignore_not_found(res: Result<(), GceError>) -> Result<(), GceError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        res => res,
    }
}

#[async_trait]
pub trait ForwardingRules: Send + Sync {
    async fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule, GceError>;
    async fn insert_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError>;
    async fn patch_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError>;
    async fn delete_forwarding_rule(&self, name: &str) -> Result<(), GceError>;
}

#[async_trait]
pub trait Firewalls: Send + Sync {
    async fn get_firewall(&self, name: &str) -> Result<Firewall, GceError>;
    async fn insert_firewall(&self, firewall: &Firewall) -> Result<(), GceError>;
    async fn update_firewall(&self, firewall: &Firewall) -> Result<(), GceError>;
    async fn patch_firewall(&self, firewall: &Firewall) -> Result<(), GceError>;
    async fn delete_firewall(&self, name: &str) -> Result<(), GceError>;
}

#[async_trait]
pub trait BackendServices: Send + Sync {
    async fn get_backend_service(&self, name: &str) -> Result<BackendService, GceError>;
    async fn insert_backend_service(&self, bs: &BackendService) -> Result<(), GceError>;
    async fn update_backend_service(&self, bs: &BackendService) -> Result<(), GceError>;
    async fn delete_backend_service(&self, name: &str) -> Result<(), GceError>;
}

#[async_trait]
pub trait HealthChecks: Send + Sync {
    async fn get_health_check(&self, name: &str) -> Result<HealthCheck, GceError>;
    async fn insert_health_check(&self, hc: &HealthCheck) -> Result<(), GceError>;
    async fn update_health_check(&self, hc: &HealthCheck) -> Result<(), GceError>;
    async fn delete_health_check(&self, name: &str) -> Result<(), GceError>;
}

#[async_trait]
pub trait InstanceGroups: Send + Sync {
    async fn list_instance_groups(&self, zone: &str) -> Result<Vec<InstanceGroup>, GceError>;
    async fn insert_instance_group(&self, zone: &str, ig: &InstanceGroup) -> Result<(), GceError>;
    async fn delete_instance_group(&self, zone: &str, name: &str) -> Result<(), GceError>;
    /// Instance URLs of the group's members.
    async fn list_instances(&self, zone: &str, name: &str) -> Result<Vec<String>, GceError>;
    async fn add_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError>;
    async fn remove_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError>;
}

#[async_trait]
pub trait Addresses: Send + Sync {
    async fn get_address(&self, name: &str) -> Result<Address, GceError>;
    async fn list_addresses(&self) -> Result<Vec<Address>, GceError>;
    async fn reserve_address(&self, address: &Address) -> Result<(), GceError>;
    async fn delete_address(&self, name: &str) -> Result<(), GceError>;
}

/// Every resource kind the load balancer engine touches.
pub trait CloudCompute:
    ForwardingRules + Firewalls + BackendServices + HealthChecks + InstanceGroups + Addresses
{
}

impl<T> CloudCompute for T where
    T: ForwardingRules + Firewalls + BackendServices + HealthChecks + InstanceGroups + Addresses
{
}
