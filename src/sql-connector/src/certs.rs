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

//! PEM/X.509 encoding and decoding used by the certificate minter and the
//! metadata fetcher.

use base64::Engine;
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;

use crate::admin_client::{AdminApiClient, EphemeralCert};
use crate::error::ConnectorError;
use crate::key_pair::KeyPair;
use crate::token_source::AccessToken;

const PEM_LINE_WIDTH: usize = 64;

/// Wraps `spki_der` (a SubjectPublicKeyInfo-encoded RSA public key) into the
/// legacy `RSA PUBLIC KEY` PEM form the Cloud SQL Admin API expects, with the
/// base64 body wrapped at 64 columns.
pub(crate) fn encode_public_key_pem(spki_der: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(spki_der);
    let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
    pem.push_str("-----BEGIN RSA PUBLIC KEY-----\n");
    for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ASCII"));
        pem.push('\n');
    }
    pem.push_str("-----END RSA PUBLIC KEY-----\n");
    pem
}

/// Decodes a PEM-encoded X.509 certificate and returns its DER bytes after
/// confirming it parses, without retaining the parsed representation (the
/// caller only needs an `expires_at` timestamp, computed separately).
pub(crate) fn parse_pem_certificate(
    connection_name: &str,
    pem: &str,
) -> Result<CertificateDer<'static>, ConnectorError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| {
            ConnectorError::parse(
                connection_name.to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "no PEM certificate block found"),
            )
        })?
        .map_err(|source| ConnectorError::parse(connection_name.to_string(), source))?;

    // Confirm the DER actually decodes as X.509 before accepting it.
    x509_parser::certificate::X509Certificate::from_der(der.as_ref())
        .map_err(|source| ConnectorError::parse(connection_name.to_string(), OwnedX509Error(source.to_string())))?;

    Ok(der.into_owned())
}

/// Reads the `notAfter` field of a DER-encoded X.509 certificate.
pub(crate) fn certificate_not_after(
    connection_name: &str,
    der: &CertificateDer<'static>,
) -> Result<OffsetDateTime, ConnectorError> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der.as_ref())
        .map_err(|source| ConnectorError::parse(connection_name.to_string(), OwnedX509Error(source.to_string())))?;
    let not_after = cert.validity().not_after;
    OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .map_err(|source| ConnectorError::parse(connection_name.to_string(), OwnedTimeError(source.to_string())))
}

/// Exchanges `key_pair`'s public half (plus, if IAM auth is enabled, a
/// trimmed access token) for a signed ephemeral client certificate.
pub(crate) async fn mint_ephemeral_certificate(
    client: &dyn AdminApiClient,
    connection_name: &str,
    project: &str,
    regional_instance: &str,
    key_pair: &KeyPair,
    access_token: Option<&AccessToken>,
) -> Result<CertificateDer<'static>, ConnectorError> {
    let public_key_pem = encode_public_key_pem(key_pair.public_key_spki_der());
    let access_token_value = access_token.map(AccessToken::value_trimmed);

    let EphemeralCert { cert } = client
        .generate_ephemeral_cert(project, regional_instance, &public_key_pem, access_token_value)
        .await?;

    parse_pem_certificate(connection_name, &cert)
}

#[derive(Debug)]
struct OwnedX509Error(String);

impl std::fmt::Display for OwnedX509Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid X.509 certificate: {}", self.0)
    }
}

impl std::error::Error for OwnedX509Error {}

#[derive(Debug)]
struct OwnedTimeError(String);

impl std::fmt::Display for OwnedTimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid certificate validity timestamp: {}", self.0)
    }
}

impl std::error::Error for OwnedTimeError {}

/// A real, self-signed Ed25519 certificate used as a fixture in unit tests
/// throughout this crate; it is not a secret, it only needs to parse.
#[cfg(test)]
pub(crate) const SELF_SIGNED_CA_PEM_FOR_TESTS: &str = "-----BEGIN CERTIFICATE-----
MIIBdDCCASagAwIBAgIIYcmKQznJFNUwBQYDK2VwMEIxCzAJBgNVBAYMAlVTMQsw
CQYDVQQIDAJDQTESMBAGA1UECgwJbGV4ZS10ZWNoMRIwEAYDVQQDDAlsZXhlLW5v
ZGUwHhcNMjIwNTIyMDAwMDAwWhcNMzIwNTIyMDAwMDAwWjBCMQswCQYDVQQGDAJV
UzELMAkGA1UECAwCQ0ExEjAQBgNVBAoMCWxleGUtdGVjaDESMBAGA1UEAwwJbGV4
ZS1ub2RlMCowBQYDK2VwAyEAzDQWHWaB67h4H0Oz32httyHwv0dz2hdkLizhsfg+
ncSjOjA4MBYGA1UdEQQPMA2CC2hlbGxvLndvcmxkMB4GCSqGSIb4TYo5BwQRMA8E
BWFhYWFhBAZ6enp6enowBQYDK2VwA0EAfE3TQMXPnIsvgGY3ZBksUQpTibPNHIVf
mRi3PWitSCzCgwJ5wnm/+4V2XViCWQ9DWEvbs7S6DmLLVTEXlVdxAA==
-----END CERTIFICATE-----
";
