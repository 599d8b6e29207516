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

//! The atomic, immutable product of one refresh cycle.

use std::sync::Arc;

use rustls::ClientConfig;
use time::OffsetDateTime;

use crate::metadata::Metadata;

/// A complete, ready-to-use set of credentials for one instance, produced by
/// one refresh cycle. Bundles are immutable once constructed; a new refresh
/// always produces a new bundle rather than mutating an existing one.
#[derive(Clone)]
pub struct CredentialBundle {
    metadata: Metadata,
    tls_config: Arc<ClientConfig>,
    expires_at: OffsetDateTime,
}

impl CredentialBundle {
    pub(crate) fn new(metadata: Metadata, tls_config: Arc<ClientConfig>, expires_at: OffsetDateTime) -> Self {
        CredentialBundle {
            metadata,
            tls_config,
            expires_at,
        }
    }

    /// The metadata this bundle was built from (IP addresses, server CA).
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The pinned client TLS configuration.
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls_config.clone()
    }

    /// `min(ephemeralCert.notAfter, accessToken.expirationTime)` when IAM
    /// auth was in use, otherwise `ephemeralCert.notAfter`.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// True if `expires_at()` is already in the past.
    pub(crate) fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("metadata", &self.metadata)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
