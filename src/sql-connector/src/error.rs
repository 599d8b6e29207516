// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Custom errors for the Cloud SQL credential manager.

use std::sync::Arc;

/// Errors surfaced by [`InstanceConnectionManager`][crate::InstanceConnectionManager]
/// and the components it composes.
///
/// [`ConnectorError`] is cheaply [`Clone`]-able: a failed refresh is cached
/// and the same error is fanned out to every caller blocked on that refresh,
/// so the inner causes are held behind [`Arc`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectorError {
    /// The connection name did not match `project[:subproject]:region:instance`.
    ///
    /// This is a programming error: it is raised synchronously when the
    /// manager is constructed and is never retried.
    #[error("invalid instance connection name {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// The admin API reported that the Cloud SQL Admin API is not enabled
    /// for the project.
    #[error(
        "Cloud SQL Admin API is not enabled for project {project:?}, or \
         the project does not exist: enable it at {console_url}"
    )]
    ApiDisabled { project: String, console_url: String },

    /// The admin API reported that the caller is not authorized for this
    /// instance, or the instance does not exist.
    #[error(
        "not authorized to access instance {connection_name:?} in project \
         {project:?}, or it does not exist"
    )]
    NotAuthorizedOrMissing {
        connection_name: String,
        project: String,
    },

    /// The fetched metadata failed a consistency check (wrong region, wrong
    /// backend type, or no IP addresses).
    #[error("invalid metadata for instance {connection_name:?}: {reason}")]
    Validation {
        connection_name: String,
        reason: String,
    },

    /// A server CA certificate or ephemeral client certificate failed X.509
    /// decoding.
    #[error("failed to parse certificate for instance {connection_name:?}: {source}")]
    Parse {
        connection_name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// Assembling the TLS client configuration failed.
    #[error("failed to assemble TLS configuration for instance {connection_name:?}: {source}")]
    Crypto {
        connection_name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// An IAM-auth-enabled instance would have had to fall back to TLS 1.2.
    #[error(
        "instance {connection_name:?} requires IAM database authentication, \
         which requires TLS 1.3, but only TLS 1.2 is available"
    )]
    Tls13Unavailable { connection_name: String },

    /// `getPreferredIp` found no IP address of any requested type.
    #[error("instance {connection_name:?} has no IP address of any of the requested types {requested:?}")]
    NoMatchingIp {
        connection_name: String,
        requested: Vec<String>,
    },

    /// Catch-all for admin-API or transport failures not otherwise
    /// classified above. The underlying cause is preserved.
    #[error("failed to refresh credentials for instance {connection_name:?}: {source}")]
    RefreshFailed {
        connection_name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl ConnectorError {
    /// True if a subsequent attempt might succeed without caller intervention.
    ///
    /// [`Self::InvalidIdentifier`], [`Self::Validation`], [`Self::Crypto`],
    /// [`Self::Parse`], and [`Self::Tls13Unavailable`] stem from a
    /// misconfigured instance or malformed material rather than a flaky
    /// admin-API call, so a retry won't self-heal them; the Refresh
    /// Orchestrator consults this to decide whether to surface such a
    /// failure on the current bundle right away rather than keep serving a
    /// not-yet-expired one (see `manager.rs`'s `on_refresh_complete`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::RefreshFailed { .. } | ConnectorError::ApiDisabled { .. }
        )
    }

    pub(crate) fn refresh_failed(
        connection_name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::RefreshFailed {
            connection_name: connection_name.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn parse(
        connection_name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Parse {
            connection_name: connection_name.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn crypto(
        connection_name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Crypto {
            connection_name: connection_name.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn validation(connection_name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectorError::Validation {
            connection_name: connection_name.into(),
            reason: reason.into(),
        }
    }
}
