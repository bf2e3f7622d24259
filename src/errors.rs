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

use thiserror::Error;

use crate::gce::GceError;

#[derive(Error, Debug)]
pub enum Error {
    /// The service belongs to another load balancer controller.
    #[error("load balancer is implemented elsewhere")]
    ImplementedElsewhere,

    #[error("{0}")]
    Validation(String),

    #[error("{kind} {name}: {source}")]
    Gce {
        kind: &'static str,
        name: String,
        #[source]
        source: GceError,
    },

    #[error("kubernetes api error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    FinalizerError(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Validation failures describe a service the cloud cannot represent, retrying won't help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::ImplementedElsewhere | Error::Validation(_))
    }
}

/// Attaches the kind and name of the cloud resource to a compute error.
pub(crate) trait ResourceContext<T> {
    fn resource(self, kind: &'static str, name: &str) -> Result<T>;
}

impl<T> ResourceContext<T> for std::result::Result<T, GceError> {
    fn resource(self, kind: &'static str, name: &str) -> Result<T> {
        self.map_err(|source| Error::Gce {
            kind,
            name: name.to_string(),
            source,
        })
    }
}
