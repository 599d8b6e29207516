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

//! Instance metadata: IP addresses and the per-instance server CA.

use std::collections::HashMap;

use rustls_pki_types::CertificateDer;

use crate::admin_client::{AdminApiClient, ConnectSettings};
use crate::error::ConnectorError;
use crate::instance_id::InstanceId;

const BACKEND_TYPE_SECOND_GEN: &str = "SECOND_GEN";

/// A well-known IP address type label reported by the admin API.
///
/// The set of labels is not closed — the admin API may introduce new ones —
/// so [`Metadata::ip_addresses`] keys by the raw string rather than this
/// enum; this type exists only to name the common cases in caller code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpAddressType {
    Primary,
    Private,
    PSC,
    Outgoing,
}

impl IpAddressType {
    pub fn as_label(self) -> &'static str {
        match self {
            IpAddressType::Primary => "PRIMARY",
            IpAddressType::Private => "PRIVATE",
            IpAddressType::PSC => "PSC",
            IpAddressType::Outgoing => "OUTGOING",
        }
    }
}

/// The validated result of one `connect.get` admin-API call.
#[derive(Clone, Debug)]
pub struct Metadata {
    ip_addresses: HashMap<String, String>,
    server_ca_certificate: CertificateDer<'static>,
}

impl Metadata {
    /// The IP address registered under `label` (e.g. `"PRIMARY"`), if any.
    pub fn ip_address(&self, label: &str) -> Option<&str> {
        self.ip_addresses.get(label).map(String::as_str)
    }

    /// All IP addresses, keyed by type label.
    pub fn ip_addresses(&self) -> &HashMap<String, String> {
        &self.ip_addresses
    }

    /// The per-instance server CA certificate, DER-encoded.
    pub fn server_ca_certificate(&self) -> &CertificateDer<'static> {
        &self.server_ca_certificate
    }
}

/// Fetches and validates metadata for `instance` via `client`.
///
/// Validates that the reported region matches `instance.region()`, the
/// backend type is `SECOND_GEN`, and at least one IP address is present, as
/// required of any metadata this crate is willing to trust.
pub(crate) async fn fetch_metadata(
    client: &dyn AdminApiClient,
    instance: &InstanceId,
) -> Result<Metadata, ConnectorError> {
    let settings: ConnectSettings = client
        .connect_settings(instance.project(), &instance.regional_instance())
        .await?;

    if settings.region != instance.region() {
        return Err(ConnectorError::validation(
            instance.connection_name(),
            format!(
                "instance region mismatch: admin API reported {:?}, expected {:?}",
                settings.region,
                instance.region()
            ),
        ));
    }

    if settings.backend_type != BACKEND_TYPE_SECOND_GEN {
        return Err(ConnectorError::validation(
            instance.connection_name(),
            format!(
                "unsupported backend type {:?}, only {:?} instances are supported",
                settings.backend_type, BACKEND_TYPE_SECOND_GEN
            ),
        ));
    }

    if settings.ip_addresses.is_empty() {
        return Err(ConnectorError::validation(
            instance.connection_name(),
            "instance has no IP addresses",
        ));
    }

    let ip_addresses = settings
        .ip_addresses
        .into_iter()
        .map(|ip| (ip.kind, ip.ip_address))
        .collect();

    let server_ca_certificate = crate::certs::parse_pem_certificate(
        &instance.connection_name(),
        &settings.server_ca_cert.cert,
    )?;

    Ok(Metadata {
        ip_addresses,
        server_ca_certificate,
    })
}
