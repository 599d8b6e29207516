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

//! The RSA key pair consumed when minting ephemeral certificates.
//!
//! This crate never generates key material. Callers supply a
//! [`KeyPairSource`]; the manager awaits it once per refresh and never
//! inspects the private half except to hand it to `rustls`.

use async_trait::async_trait;
use rustls_pki_types::PrivatePkcs8KeyDer;

use crate::error::ConnectorError;

/// An RSA key pair: a PKCS#8-encoded private key and the matching
/// SubjectPublicKeyInfo-encoded public key, both DER.
#[derive(Clone)]
pub struct KeyPair {
    private_key_pkcs8_der: Vec<u8>,
    public_key_spki_der: Vec<u8>,
}

impl KeyPair {
    /// Builds a key pair from its PKCS#8 private key DER and SPKI public key DER.
    pub fn from_der(private_key_pkcs8_der: Vec<u8>, public_key_spki_der: Vec<u8>) -> Self {
        KeyPair {
            private_key_pkcs8_der,
            public_key_spki_der,
        }
    }

    /// The private key, ready to hand to `rustls` as a `PrivateKeyDer`.
    pub(crate) fn private_key_der(&self) -> PrivatePkcs8KeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.private_key_pkcs8_der.clone())
    }

    /// The public key's raw SubjectPublicKeyInfo DER bytes, prior to PEM encoding.
    pub(crate) fn public_key_spki_der(&self) -> &[u8] {
        &self.public_key_spki_der
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key_pkcs8_der", &"[censored]")
            .field("public_key_spki_der_len", &self.public_key_spki_der.len())
            .finish()
    }
}

/// Supplies the [`KeyPair`] used for every refresh of one instance.
///
/// Implementations may generate the pair lazily and cache it; the manager
/// calls [`KeyPairSource::key_pair`] once per refresh cycle and expects
/// repeated calls to be cheap once the pair is ready.
#[async_trait]
pub trait KeyPairSource: Send + Sync {
    /// Returns the key pair, generating or loading it on first use if needed.
    async fn key_pair(&self) -> Result<KeyPair, ConnectorError>;
}

/// A [`KeyPairSource`] that always returns a pre-built [`KeyPair`].
///
/// Useful for tests and for embedders that generate the key pair eagerly at
/// startup.
#[derive(Clone, Debug)]
pub struct StaticKeyPairSource(KeyPair);

impl StaticKeyPairSource {
    pub fn new(key_pair: KeyPair) -> Self {
        StaticKeyPairSource(key_pair)
    }
}

#[async_trait]
impl KeyPairSource for StaticKeyPairSource {
    async fn key_pair(&self) -> Result<KeyPair, ConnectorError> {
        Ok(self.0.clone())
    }
}
