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

//! The OAuth2 access token credential used for IAM database authentication.
//!
//! This crate does not fetch tokens itself; it consumes an
//! [`AccessTokenSource`] supplied by the embedder, exactly as it consumes an
//! [`AdminApiClient`][crate::AdminApiClient] and a
//! [`KeyPairSource`][crate::KeyPairSource].

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::ConnectorError;

/// An OAuth2 access token and its expiration time.
#[derive(Clone)]
pub struct AccessToken {
    value: String,
    expires_at: OffsetDateTime,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        AccessToken {
            value: value.into(),
            expires_at,
        }
    }

    /// The raw token value, with any trailing `.` characters already trimmed.
    ///
    /// Some IAM token providers append a trailing `.` that the Cloud SQL
    /// Admin API rejects; this workaround must be preserved until the
    /// upstream issue is fixed.
    pub(crate) fn value_trimmed(&self) -> &str {
        self.value.trim_end_matches('.')
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[censored]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies OAuth2 access tokens for IAM database authentication.
///
/// Implementations are free to cache and refresh internally; the manager
/// calls [`AccessTokenSource::access_token`] once per refresh when IAM auth
/// is enabled and treats every call as potentially triggering network I/O.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Forces the underlying provider to refresh its token.
    async fn refresh(&self) -> Result<(), ConnectorError>;

    /// Returns the current (or freshly refreshed) access token.
    async fn access_token(&self) -> Result<AccessToken, ConnectorError>;
}

/// Marker [`AccessTokenSource`] for instances that do not use IAM database
/// authentication.
///
/// The manager never calls this type's methods; its presence only tells
/// [`InstanceConnectionConfig`][crate::InstanceConnectionConfig] that IAM
/// auth is disabled for the instance, which selects the 5-minute safety
/// buffer and the TLS 1.2 fallback allowance.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIamAuth;

#[async_trait]
impl AccessTokenSource for NoIamAuth {
    async fn refresh(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn access_token(&self) -> Result<AccessToken, ConnectorError> {
        unreachable!("NoIamAuth::access_token must never be called by the manager")
    }
}
