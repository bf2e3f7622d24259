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

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::runtime::{predicates, reflector, watcher, Controller, Predicate, WatchStreamExt};
use kube::{Api, Client};
use log::{debug, info, warn};

use crate::constants::{
    DELETED_LB_EVENT_REASON, DELETING_LB_EVENT_REASON, ENSURED_LB_EVENT_REASON,
    ENSURING_LB_EVENT_REASON, SYNC_LB_FAILED_EVENT_REASON,
};
use crate::errors::{Error, Result};
use crate::loadbalancer::{self, ManagementState};
use crate::{utils, Ctx, State};

const RETRY_AFTER: Duration = Duration::from_secs(10);

pub async fn run(state: State) -> anyhow::Result<()> {
    info!("starting L4 load balancer controller....");
    let client = Client::try_default()
        .await
        .context("failed to create k8s client")?;
    let api = Api::<Service>::all(client.clone());
    let (reader, writer) = reflector::store();
    let services = reader.clone();
    let changes = watcher(api, Config::default())
        .reflect(writer)
        .touched_objects()
        .predicate_filter(
            predicates::generation
                .combine(predicates::labels)
                .combine(predicates::annotations)
                .combine(predicates::resource_version),
        );
    Controller::for_stream(changes, reader)
        .watches(
            Api::<Node>::all(client.clone()),
            Config::default(),
            move |_: Node| load_balancer_refs(&services.state()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}

/// Services that have, or may need, cloud resources. Anything else never lists nodes.
fn has_load_balancer_work(svc: &Service) -> bool {
    utils::is_svc_type_lb(svc) || loadbalancer::has_our_finalizer(svc)
}

/// Node changes move backends, so every such Service is reconciled again.
fn load_balancer_refs(services: &[Arc<Service>]) -> Vec<ObjectRef<Service>> {
    services
        .iter()
        .filter(|svc| has_load_balancer_work(svc))
        .map(|svc| ObjectRef::from_obj(svc.as_ref()))
        .collect()
}

/// Whether the Service should have a load balancer right now.
fn wants_load_balancer(svc: &Service) -> bool {
    utils::is_svc_type_lb(svc) && svc.metadata.deletion_timestamp.is_none()
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<Ctx>) -> Result<Action> {
    if loadbalancer::classify(&svc) == ManagementState::Unmanaged
        && !loadbalancer::has_our_finalizer(&svc)
    {
        debug!(
            "service {} is handled by another controller",
            utils::service_key(&svc)
        );
        return Ok(Action::await_change());
    }
    if !has_load_balancer_work(&svc) {
        return Ok(Action::await_change());
    }

    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    ctx.lb.observe_nodes(&nodes).await;

    if !wants_load_balancer(&svc) {
        return cleanup(svc, ctx).await;
    }

    ctx.events
        .normal(&svc, ENSURING_LB_EVENT_REASON, "Ensuring load balancer".into())
        .await;
    let status = match ensure(&svc, &ctx, &nodes).await {
        Ok(status) => status,
        Err(Error::ImplementedElsewhere) => return Ok(Action::await_change()),
        Err(e) => {
            ctx.events
                .warning(
                    &svc,
                    SYNC_LB_FAILED_EVENT_REASON,
                    format!("Error syncing load balancer: {}", e),
                )
                .await;
            return Err(e);
        }
    };
    ctx.writer.update_load_balancer_status(&svc, status).await?;
    ctx.events
        .normal(&svc, ENSURED_LB_EVENT_REASON, "Ensured load balancer".into())
        .await;
    Ok(Action::requeue(ctx.resync_period))
}

async fn ensure(svc: &Service, ctx: &Ctx, nodes: &[Node]) -> Result<LoadBalancerStatus> {
    let (_, exists) = ctx.lb.get_load_balancer(svc).await?;
    if !exists {
        return ctx.lb.ensure_load_balancer(svc, nodes).await;
    }
    ctx.lb.update_load_balancer(svc, nodes).await?;
    let (status, _) = ctx.lb.get_load_balancer(svc).await?;
    Ok(status.unwrap_or_default())
}

async fn cleanup(svc: Arc<Service>, ctx: Arc<Ctx>) -> Result<Action> {
    if !loadbalancer::has_our_finalizer(&svc) {
        debug!(
            "no load balancer to clean up for service {}",
            utils::service_key(&svc)
        );
        return Ok(Action::await_change());
    }
    ctx.events
        .normal(&svc, DELETING_LB_EVENT_REASON, "Deleting load balancer".into())
        .await;
    match ctx.lb.ensure_load_balancer_deleted(&svc).await {
        Ok(()) => {}
        Err(Error::ImplementedElsewhere) => return Ok(Action::await_change()),
        Err(e) => {
            ctx.events
                .warning(
                    &svc,
                    SYNC_LB_FAILED_EVENT_REASON,
                    format!("Error deleting load balancer: {}", e),
                )
                .await;
            return Err(e);
        }
    }
    if svc.metadata.deletion_timestamp.is_none() {
        ctx.writer.reset_load_balancer_status(&svc).await?;
    }
    ctx.events
        .normal(&svc, DELETED_LB_EVENT_REASON, "Deleted load balancer".into())
        .await;
    Ok(Action::await_change())
}

fn error_policy(svc: Arc<Service>, err: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(
        "reconcile failed for service {}: {}",
        utils::service_key(&svc),
        err
    );
    if err.is_retryable() {
        Action::requeue(RETRY_AFTER)
    } else {
        Action::await_change()
    }
}
