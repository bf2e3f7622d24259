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

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::ACCEPT;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    Address, Addresses, BackendService, BackendServices, Firewall, Firewalls, ForwardingRule,
    ForwardingRules, GceError, HealthCheck, HealthChecks, InstanceGroup, InstanceGroups,
};
use crate::config::GceConfig;
use crate::constants::{COMPUTE_ENDPOINT, WAIT_FOR_OP_NUM_RETRIES};
use crate::{gcp_auth, utils};

/// Where an operation lives, which decides the endpoint used to wait for it.
enum Scope<'a> {
    Global(&'a str),
    Regional,
    Zonal(&'a str),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct InstanceWithNamedPorts {
    instance: String,
}

/// Compute REST client scoped to one project and region.
///
/// Firewalls are global and live in the network project, which differs from the cluster
/// project in a shared VPC.
pub struct ComputeClient {
    http: reqwest::Client,
    project: String,
    region: String,
    network_project: String,
}

impl ComputeClient {
    pub fn new(config: &GceConfig) -> Self {
        ComputeClient {
            http: reqwest::Client::new(),
            project: config.project_id.clone(),
            region: config.region.clone(),
            network_project: config.network_project_id.clone(),
        }
    }

    fn regional_url(&self, path: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/regions/{}/{}",
            COMPUTE_ENDPOINT, self.project, self.region, path
        )
    }

    fn zonal_url(&self, zone: &str, path: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/zones/{}/{}",
            COMPUTE_ENDPOINT, self.project, zone, path
        )
    }

    fn firewall_url(&self, path: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/global/{}",
            COMPUTE_ENDPOINT, self.network_project, path
        )
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, GceError> {
        let auth_token = gcp_auth::get_access_token().await?;
        let res = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .bearer_auth(&auth_token)
            .send()
            .await?;
        Ok(check_status(res, &url).await?.json::<T>().await?)
    }

    async fn list<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>, GceError> {
        let mut items = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let page_url = match &page_token {
                Some(token) => format!("{}?pageToken={}", url, token),
                None => url.clone(),
            };
            let page: ListPage<T> = self.get(page_url).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn mutate(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        scope: Scope<'_>,
    ) -> Result<(), GceError> {
        let auth_token = gcp_auth::get_access_token().await?;
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header(ACCEPT, "application/json")
            .bearer_auth(&auth_token);
        if let Some(payload) = &body {
            debug!(
                "{} {} payload: {}",
                method,
                url,
                serde_json::to_string(payload)?
            );
            req = req.json(payload);
        }
        let op = check_status(req.send().await?, &url)
            .await?
            .json::<Value>()
            .await?;
        self.wait_for_op(&auth_token, op, scope).await
    }

    async fn wait_for_op(
        &self,
        auth_token: &str,
        mut op: Value,
        scope: Scope<'_>,
    ) -> Result<(), GceError> {
        let operation = op["name"].as_str().unwrap_or_default().to_string();
        let mut retries = WAIT_FOR_OP_NUM_RETRIES;
        loop {
            if op["status"].as_str().eq(&Some("DONE")) {
                return operation_result(&op);
            }
            if operation.is_empty() {
                return Err(GceError::Api {
                    status: 0,
                    message: format!("response is not an operation: {}", op),
                });
            }
            if retries == 0 {
                return Err(GceError::OperationTimeout(operation));
            }
            let endpoint = match scope {
                Scope::Global(project) => format!(
                    "{}/compute/v1/projects/{}/global/operations/{}/wait",
                    COMPUTE_ENDPOINT, project, operation
                ),
                Scope::Regional => self.regional_url(&format!("operations/{}/wait", operation)),
                Scope::Zonal(zone) => {
                    self.zonal_url(zone, &format!("operations/{}/wait", operation))
                }
            };
            let res = self
                .http
                .post(&endpoint)
                .header(ACCEPT, "application/json")
                .bearer_auth(auth_token)
                .send()
                .await?;
            op = check_status(res, &endpoint).await?.json::<Value>().await?;
            if !op["status"].as_str().eq(&Some("DONE")) {
                info!(
                    "retrying wait for operation: {} current status: {:?}",
                    operation,
                    op["status"].as_str()
                );
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            retries -= 1;
        }
    }
}

async fn check_status(res: Response, url: &str) -> Result<Response, GceError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.json::<Value>().await.unwrap_or(Value::Null);
    Err(classify_error(status, &body, url))
}

fn classify_error(status: StatusCode, body: &Value, url: &str) -> GceError {
    let message = body["error"]["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| url.to_string());
    let reason = body["error"]["errors"][0]["reason"].as_str().unwrap_or("");
    match status {
        StatusCode::NOT_FOUND => GceError::NotFound(message),
        StatusCode::FORBIDDEN => GceError::Forbidden(message),
        StatusCode::CONFLICT => GceError::AlreadyExists(message),
        _ if reason == "resourceInUseByAnotherResource" => GceError::InUse(message),
        _ if reason == "alreadyExists" || reason == "memberAlreadyExists" => {
            GceError::AlreadyExists(message)
        }
        _ => GceError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn operation_result(op: &Value) -> Result<(), GceError> {
    let Some(error) = op["error"]["errors"].as_array().and_then(|e| e.first()) else {
        return Ok(());
    };
    let code = error["code"].as_str().unwrap_or("");
    let message = error["message"].as_str().unwrap_or(code).to_string();
    Err(if code.contains("NOT_FOUND") {
        GceError::NotFound(message)
    } else if code.contains("IN_USE") {
        GceError::InUse(message)
    } else if code.contains("ALREADY_EXISTS") {
        GceError::AlreadyExists(message)
    } else if code.contains("PERMISSION") || code.contains("FORBIDDEN") {
        GceError::Forbidden(message)
    } else {
        GceError::Api {
            status: op["httpErrorStatusCode"].as_u64().unwrap_or(0) as u16,
            message,
        }
    })
}

#[async_trait]
impl ForwardingRules for ComputeClient {
    async fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule, GceError> {
        self.get(self.regional_url(&format!("forwardingRules/{}", name)))
            .await
    }

    async fn insert_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError> {
        let body = serde_json::to_value(rule)?;
        self.mutate(
            Method::POST,
            self.regional_url("forwardingRules"),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn patch_forwarding_rule(&self, rule: &ForwardingRule) -> Result<(), GceError> {
        // Only allowGlobalAccess can be patched in place.
        let body = json!({ "allowGlobalAccess": rule.allow_global_access });
        self.mutate(
            Method::PATCH,
            self.regional_url(&format!("forwardingRules/{}", rule.name)),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn delete_forwarding_rule(&self, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.regional_url(&format!("forwardingRules/{}", name)),
            None,
            Scope::Regional,
        )
        .await
    }
}

#[async_trait]
impl Firewalls for ComputeClient {
    async fn get_firewall(&self, name: &str) -> Result<Firewall, GceError> {
        self.get(self.firewall_url(&format!("firewalls/{}", name)))
            .await
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let body = serde_json::to_value(firewall)?;
        self.mutate(
            Method::POST,
            self.firewall_url("firewalls"),
            Some(body),
            Scope::Global(&self.network_project),
        )
        .await
    }

    async fn update_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let body = serde_json::to_value(firewall)?;
        self.mutate(
            Method::PUT,
            self.firewall_url(&format!("firewalls/{}", firewall.name)),
            Some(body),
            Scope::Global(&self.network_project),
        )
        .await
    }

    async fn patch_firewall(&self, firewall: &Firewall) -> Result<(), GceError> {
        let body = serde_json::to_value(firewall)?;
        self.mutate(
            Method::PATCH,
            self.firewall_url(&format!("firewalls/{}", firewall.name)),
            Some(body),
            Scope::Global(&self.network_project),
        )
        .await
    }

    async fn delete_firewall(&self, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.firewall_url(&format!("firewalls/{}", name)),
            None,
            Scope::Global(&self.network_project),
        )
        .await
    }
}

#[async_trait]
impl BackendServices for ComputeClient {
    async fn get_backend_service(&self, name: &str) -> Result<BackendService, GceError> {
        self.get(self.regional_url(&format!("backendServices/{}", name)))
            .await
    }

    async fn insert_backend_service(&self, bs: &BackendService) -> Result<(), GceError> {
        let body = serde_json::to_value(bs)?;
        self.mutate(
            Method::POST,
            self.regional_url("backendServices"),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn update_backend_service(&self, bs: &BackendService) -> Result<(), GceError> {
        let body = serde_json::to_value(bs)?;
        self.mutate(
            Method::PUT,
            self.regional_url(&format!("backendServices/{}", bs.name)),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn delete_backend_service(&self, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.regional_url(&format!("backendServices/{}", name)),
            None,
            Scope::Regional,
        )
        .await
    }
}

#[async_trait]
impl HealthChecks for ComputeClient {
    async fn get_health_check(&self, name: &str) -> Result<HealthCheck, GceError> {
        self.get(self.regional_url(&format!("healthChecks/{}", name)))
            .await
    }

    async fn insert_health_check(&self, hc: &HealthCheck) -> Result<(), GceError> {
        let body = serde_json::to_value(hc)?;
        self.mutate(
            Method::POST,
            self.regional_url("healthChecks"),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn update_health_check(&self, hc: &HealthCheck) -> Result<(), GceError> {
        let body = serde_json::to_value(hc)?;
        self.mutate(
            Method::PUT,
            self.regional_url(&format!("healthChecks/{}", hc.name)),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn delete_health_check(&self, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.regional_url(&format!("healthChecks/{}", name)),
            None,
            Scope::Regional,
        )
        .await
    }
}

#[async_trait]
impl InstanceGroups for ComputeClient {
    async fn list_instance_groups(&self, zone: &str) -> Result<Vec<InstanceGroup>, GceError> {
        self.list(self.zonal_url(zone, "instanceGroups")).await
    }

    async fn insert_instance_group(&self, zone: &str, ig: &InstanceGroup) -> Result<(), GceError> {
        let body = serde_json::to_value(ig)?;
        self.mutate(
            Method::POST,
            self.zonal_url(zone, "instanceGroups"),
            Some(body),
            Scope::Zonal(zone),
        )
        .await
    }

    async fn delete_instance_group(&self, zone: &str, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.zonal_url(zone, &format!("instanceGroups/{}", name)),
            None,
            Scope::Zonal(zone),
        )
        .await
    }

    async fn list_instances(&self, zone: &str, name: &str) -> Result<Vec<String>, GceError> {
        let url = self.zonal_url(zone, &format!("instanceGroups/{}/listInstances", name));
        let auth_token = gcp_auth::get_access_token().await?;
        let mut instances = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let page_url = match &page_token {
                Some(token) => format!("{}?pageToken={}", url, token),
                None => url.clone(),
            };
            let res = self
                .http
                .post(&page_url)
                .header(ACCEPT, "application/json")
                .bearer_auth(&auth_token)
                .json(&json!({ "instanceState": "ALL" }))
                .send()
                .await?;
            let page = check_status(res, &page_url)
                .await?
                .json::<ListPage<InstanceWithNamedPorts>>()
                .await?;
            instances.extend(page.items.into_iter().map(|i| i.instance));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    async fn add_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError> {
        let body = json!({
            "instances": instances
                .iter()
                .map(|i| json!({ "instance": utils::build_instance_url(&self.project, zone, i) }))
                .collect::<Vec<_>>()
        });
        match self
            .mutate(
                Method::POST,
                self.zonal_url(zone, &format!("instanceGroups/{}/addInstances", name)),
                Some(body),
                Scope::Zonal(zone),
            )
            .await
        {
            Err(e) if e.is_already_exists() => {
                debug!("instances already members of the group: {}/{}", zone, name);
                Ok(())
            }
            res => res,
        }
    }

    async fn remove_instances(
        &self,
        zone: &str,
        name: &str,
        instances: &[String],
    ) -> Result<(), GceError> {
        let body = json!({
            "instances": instances
                .iter()
                .map(|i| json!({ "instance": utils::build_instance_url(&self.project, zone, i) }))
                .collect::<Vec<_>>()
        });
        self.mutate(
            Method::POST,
            self.zonal_url(zone, &format!("instanceGroups/{}/removeInstances", name)),
            Some(body),
            Scope::Zonal(zone),
        )
        .await
    }
}

#[async_trait]
impl Addresses for ComputeClient {
    async fn get_address(&self, name: &str) -> Result<Address, GceError> {
        self.get(self.regional_url(&format!("addresses/{}", name)))
            .await
    }

    async fn list_addresses(&self) -> Result<Vec<Address>, GceError> {
        self.list(self.regional_url("addresses")).await
    }

    async fn reserve_address(&self, address: &Address) -> Result<(), GceError> {
        let body = serde_json::to_value(address)?;
        self.mutate(
            Method::POST,
            self.regional_url("addresses"),
            Some(body),
            Scope::Regional,
        )
        .await
    }

    async fn delete_address(&self, name: &str) -> Result<(), GceError> {
        self.mutate(
            Method::DELETE,
            self.regional_url(&format!("addresses/{}", name)),
            None,
            Scope::Regional,
        )
        .await
    }
}
