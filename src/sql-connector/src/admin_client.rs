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

//! The two Cloud SQL Admin API operations the credential manager invokes.
//!
//! Everything else about the admin-API transport — connection pooling,
//! retries, auth headers for the admin API itself — is out of scope here;
//! [`ReqwestAdminApiClient`] issues one HTTP request per call and maps
//! transport/HTTP failures onto [`ConnectorError`]. Retry policy for a
//! *failed refresh* belongs to the Refresh Orchestrator, not this client.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ConnectorError;

const SQLADMIN_BASE_URL: &str = "https://sqladmin.googleapis.com/sql/v1beta4";

/// The response of `connect.get(project, regionalInstance)`.
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectSettings {
    pub region: String,
    #[serde(rename = "backendType")]
    pub backend_type: String,
    #[serde(rename = "ipAddresses", default)]
    pub ip_addresses: Vec<IpMapping>,
    #[serde(rename = "serverCaCert")]
    pub server_ca_cert: ServerCaCert,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IpMapping {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerCaCert {
    pub cert: String,
}

/// The response of `connect.generateEphemeralCert(...)`.
#[derive(Clone, Debug, Deserialize)]
pub struct EphemeralCert {
    #[serde(rename = "cert")]
    pub cert: String,
}

#[derive(Deserialize)]
struct EphemeralCertEnvelope {
    #[serde(rename = "ephemeralCert")]
    ephemeral_cert: EphemeralCert,
}

/// The subset of the Cloud SQL Admin API the credential manager invokes.
///
/// Implementations are shared process-wide across managers and are assumed
/// internally thread-safe; the manager serializes nothing about calls to
/// this trait beyond its own per-instance rate limiting.
#[async_trait]
pub trait AdminApiClient: Send + Sync {
    /// `connect.get`: fetches instance metadata.
    async fn connect_settings(
        &self,
        project: &str,
        regional_instance: &str,
    ) -> Result<ConnectSettings, ConnectorError>;

    /// `connect.generateEphemeralCert`: mints a client certificate bound to
    /// `public_key_pem`, optionally carrying an IAM `access_token`.
    async fn generate_ephemeral_cert(
        &self,
        project: &str,
        regional_instance: &str,
        public_key_pem: &str,
        access_token: Option<&str>,
    ) -> Result<EphemeralCert, ConnectorError>;
}

/// The default [`AdminApiClient`], backed by [`reqwest`].
#[derive(Clone, Debug)]
pub struct ReqwestAdminApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestAdminApiClient {
    /// Builds a client pointed at the production Cloud SQL Admin API.
    pub fn new(http: reqwest::Client) -> Self {
        ReqwestAdminApiClient {
            http,
            base_url: SQLADMIN_BASE_URL.to_string(),
        }
    }

    /// Builds a client pointed at `base_url`, for use against test doubles
    /// of the admin API.
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        ReqwestAdminApiClient {
            http,
            base_url: base_url.into(),
        }
    }

    fn remap_error(&self, project: &str, connection_name: &str, status: reqwest::StatusCode, body: &str) -> ConnectorError {
        if status == reqwest::StatusCode::FORBIDDEN && body.contains("accessNotConfigured") {
            return ConnectorError::ApiDisabled {
                project: project.to_string(),
                console_url: format!(
                    "https://console.cloud.google.com/apis/api/sqladmin/overview?project={project}"
                ),
            };
        }
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::NOT_FOUND {
            return ConnectorError::NotAuthorizedOrMissing {
                connection_name: connection_name.to_string(),
                project: project.to_string(),
            };
        }
        ConnectorError::refresh_failed(
            connection_name.to_string(),
            std::io::Error::other(format!("admin API returned {status}: {body}")),
        )
    }
}

#[async_trait]
impl AdminApiClient for ReqwestAdminApiClient {
    async fn connect_settings(
        &self,
        project: &str,
        regional_instance: &str,
    ) -> Result<ConnectSettings, ConnectorError> {
        let connection_name = format!("{project}:{regional_instance}");
        let url = format!("{}/connect/{project}/{regional_instance}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ConnectorError::refresh_failed(connection_name.clone(), source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.remap_error(project, &connection_name, status, &body));
        }

        response
            .json::<ConnectSettings>()
            .await
            .map_err(|source| ConnectorError::refresh_failed(connection_name, source))
    }

    async fn generate_ephemeral_cert(
        &self,
        project: &str,
        regional_instance: &str,
        public_key_pem: &str,
        access_token: Option<&str>,
    ) -> Result<EphemeralCert, ConnectorError> {
        let connection_name = format!("{project}:{regional_instance}");
        let url = format!(
            "{}/connect/{project}/{regional_instance}:generateEphemeralCert",
            self.base_url
        );

        #[derive(serde::Serialize)]
        struct Body<'a> {
            #[serde(rename = "public_key")]
            public_key: &'a str,
            #[serde(rename = "access_token", skip_serializing_if = "Option::is_none")]
            access_token: Option<&'a str>,
        }

        let response = self
            .http
            .post(&url)
            .json(&Body {
                public_key: public_key_pem,
                access_token,
            })
            .send()
            .await
            .map_err(|source| ConnectorError::refresh_failed(connection_name.clone(), source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.remap_error(project, &connection_name, status, &body));
        }

        let envelope = response
            .json::<EphemeralCertEnvelope>()
            .await
            .map_err(|source| ConnectorError::refresh_failed(connection_name, source))?;
        Ok(envelope.ephemeral_cert)
    }
}
