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
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use log::warn;

use crate::constants::CONTROLLER_NAME;
use crate::utils;

/// Publishes Kubernetes events against a Service.
///
/// Events are informational, so implementations log and swallow their own failures.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, svc: &Service, type_: EventType, reason: &str, note: String);

    async fn normal(&self, svc: &Service, reason: &str, note: String) {
        self.publish(svc, EventType::Normal, reason, note).await
    }

    async fn warning(&self, svc: &Service, reason: &str, note: String) {
        self.publish(svc, EventType::Warning, reason, note).await
    }
}

pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        KubeEventRecorder {
            client,
            reporter: CONTROLLER_NAME.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, svc: &Service, type_: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            svc.object_ref(&()),
        );
        let res = recorder
            .publish(Event {
                type_,
                reason: reason.into(),
                note: Some(note),
                action: reason.into(),
                secondary: None,
            })
            .await;
        if let Err(e) = res {
            warn!(
                "failed to publish {} event for service {}: {}",
                reason,
                utils::service_key(svc),
                e
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::EventRecorder;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Service;
    use kube::runtime::events::EventType;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct RecordedEvent {
        pub warning: bool,
        pub reason: String,
        pub note: String,
    }

    #[derive(Default)]
    pub(crate) struct RecordingEvents {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEvents {
        pub(crate) fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
            self.events()
                .into_iter()
                .filter(|e| e.reason == reason)
                .collect()
        }
    }

    #[async_trait]
    impl EventRecorder for RecordingEvents {
        async fn publish(&self, _svc: &Service, type_: EventType, reason: &str, note: String) {
            self.events.lock().unwrap().push(RecordedEvent {
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}
