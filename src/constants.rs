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

pub const COMPUTE_ENDPOINT: &'static str = "https://compute.googleapis.com";
pub(crate) const DEFAULT_TOKEN_URI: &'static str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
pub(crate) const PROJECT_ID_URI: &'static str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";
pub(crate) const INSTANCE_ZONE_URI: &'static str =
    "http://metadata.google.internal/computeMetadata/v1/instance/zone";
pub(crate) const GCP_TOKEN_URI: &str = "https://accounts.google.com/o/oauth2/token";
pub(crate) const CREDENTIALS_FILE: &str = ".config/gcloud/application_default_credentials.json";
pub(crate) const WAIT_FOR_OP_NUM_RETRIES: i32 = 4;

pub(crate) const CONTROLLER_NAME: &str = "gce-l4-lb-controller";

// Service annotations
pub(crate) const LB_TYPE_ANNOTATION_KEY: &str = "networking.gke.io/load-balancer-type";
pub(crate) const LB_TYPE_ANNOTATION_KEY_LEGACY: &str = "cloud.google.com/load-balancer-type";
pub(crate) const LB_TYPE_INTERNAL: &str = "Internal";
pub(crate) const ILB_GLOBAL_ACCESS_ANNOTATION_KEY: &str =
    "networking.gke.io/internal-load-balancer-allow-global-access";
pub(crate) const ILB_SUBNET_ANNOTATION_KEY: &str = "networking.gke.io/internal-load-balancer-subnet";
pub(crate) const LB_SOURCE_RANGES_ANNOTATION_KEY: &str =
    "service.beta.kubernetes.io/load-balancer-source-ranges";
pub(crate) const RBS_ANNOTATION_KEY: &str = "cloud.google.com/l4-rbs";
pub(crate) const RBS_ENABLED: &str = "enabled";

// Service finalizers
pub(crate) const ILB_FINALIZER_V1: &str = "gke.networking.io/l4-ilb-v1";
pub(crate) const ILB_FINALIZER_V2: &str = "gke.networking.io/l4-ilb-v2";
pub(crate) const NETLB_FINALIZER_LEGACY: &str = "gke.networking.io/l4-netlb-legacy";
pub(crate) const NETLB_FINALIZER_RBS: &str = "gke.networking.io/l4-netlb-v1";

// Service conditions and event reasons
pub(crate) const LB_PORTS_ERROR_CONDITION: &str = "LoadBalancerPortsError";
pub(crate) const MIXED_PROTOCOL_ERROR: &str = "mixed protocol is not supported for LoadBalancer";
pub(crate) const MIXED_PROTOCOL_REASON: &str = "MixedProtocolNotSupported";
pub(crate) const XPN_FIREWALL_EVENT_REASON: &str = "XPNFirewallChangeRequired";
pub(crate) const ENSURING_LB_EVENT_REASON: &str = "EnsuringLoadBalancer";
pub(crate) const ENSURED_LB_EVENT_REASON: &str = "EnsuredLoadBalancer";
pub(crate) const DELETING_LB_EVENT_REASON: &str = "DeletingLoadBalancer";
pub(crate) const DELETED_LB_EVENT_REASON: &str = "DeletedLoadBalancer";
pub(crate) const SYNC_LB_FAILED_EVENT_REASON: &str = "SyncLoadBalancerFailed";

// Node labels
pub(crate) const NODE_ZONE_LABEL_KEY: &str = "topology.kubernetes.io/zone";
pub(crate) const NODE_ZONE_LABEL_KEY_LEGACY: &str = "failure-domain.beta.kubernetes.io/zone";
pub(crate) const NODE_SUBNET_LABEL_KEY: &str = "cloud.google.com/gke-np-subnet";
pub(crate) const NODE_EXCLUDE_LB_LABEL_KEY: &str =
    "node.kubernetes.io/exclude-from-external-load-balancers";

// Loadbalancer firewall CIDRs
pub(crate) const NLB_FIREWALL_CIDR: &str = "35.191.0.0/16,209.85.152.0/22,209.85.204.0/22";
pub(crate) const ILB_FIREWALL_CIDR: &str = "130.211.0.0/22,35.191.0.0/16";
pub(crate) const ALL_IPV4_CIDR: &str = "0.0.0.0/0";

// Firewall priorities, lower numbers are evaluated first
pub(crate) const DEFAULT_FIREWALL_PRIORITY: i32 = 1000;
pub(crate) const ALLOW_PRIORITY_WITH_DENY: i32 = 999;
pub(crate) const DENY_FIREWALL_PRIORITY: i32 = 1000;

// Health check minimums
pub(crate) const HC_CHECK_INTERVAL_SEC: i64 = 8;
pub(crate) const HC_TIMEOUT_SEC: i64 = 1;
pub(crate) const HC_HEALTHY_THRESHOLD: i64 = 1;
pub(crate) const HC_UNHEALTHY_THRESHOLD: i64 = 3;
pub(crate) const HC_REQUEST_PATH: &str = "/healthz";
pub(crate) const NODES_HEALTH_CHECK_PORT: i32 = 10256;

pub(crate) const MAX_INSTANCES_PER_INSTANCE_GROUP: usize = 1000;
pub(crate) const MAX_L4_PORTS: usize = 5;
pub(crate) const MAX_RESOURCE_NAME_LENGTH: usize = 63;
