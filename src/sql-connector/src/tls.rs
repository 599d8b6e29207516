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

//! Assembles a pinned client [`rustls::ClientConfig`] from a key pair, an
//! ephemeral client certificate, and a per-instance server CA.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;

use crate::error::ConnectorError;
use crate::key_pair::KeyPair;

/// TLS 1.3-only protocol set, preferred whenever IAM auth is enabled or the
/// runtime otherwise supports it.
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// TLS 1.3-preferred, TLS 1.2-fallback protocol set, used only when IAM auth
/// is disabled.
static TLS13_AND_TLS12: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Builds a client TLS configuration trusting only `server_ca_certificate`
/// and presenting `ephemeral_certificate` signed by `key_pair`.
///
/// When `iam_auth_enabled` is true, the configuration is restricted to TLS
/// 1.3: falling back to TLS 1.2 under IAM auth is a fatal
/// [`ConnectorError::Tls13Unavailable`], per the instance's authentication
/// contract with the database engine.
pub(crate) fn assemble_client_config(
    connection_name: &str,
    key_pair: &KeyPair,
    ephemeral_certificate: CertificateDer<'static>,
    server_ca_certificate: CertificateDer<'static>,
    iam_auth_enabled: bool,
) -> Result<Arc<ClientConfig>, ConnectorError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(server_ca_certificate)
        .map_err(|source| ConnectorError::crypto(connection_name.to_string(), source))?;
    let roots = Arc::new(roots);

    let verifier = WebPkiServerVerifier::builder(roots)
        .build()
        .map_err(|source| ConnectorError::crypto(connection_name.to_string(), source))?;

    let protocol_versions = if iam_auth_enabled { TLS13_ONLY } else { TLS13_AND_TLS12 };

    #[allow(clippy::disallowed_methods)]
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versioned_builder = ClientConfig::builder_with_provider(provider).with_protocol_versions(protocol_versions);

    let versioned_builder = match versioned_builder {
        Ok(builder) => builder,
        Err(source) if iam_auth_enabled => {
            return Err(ConnectorError::Tls13Unavailable {
                connection_name: connection_name.to_string(),
            })
            .map_err(|e| {
                tracing::warn!(%connection_name, %source, "TLS 1.3 unavailable for IAM-auth-enabled instance");
                e
            });
        }
        Err(source) => return Err(ConnectorError::crypto(connection_name.to_string(), source)),
    };

    let builder = versioned_builder
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let cert_chain = vec![ephemeral_certificate];
    let private_key = key_pair.private_key_der().into();

    let config = builder
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|source| ConnectorError::crypto(connection_name.to_string(), source))?;

    Ok(Arc::new(config))
}
