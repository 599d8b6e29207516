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

//! Google Cloud Client Libraries for Rust - Cloud SQL credential manager
//!
//! **WARNING:** this crate is under active development. We expect multiple
//! breaking changes in the upcoming releases. Testing is also incomplete, we do
//! **not** recommend that you use this crate in production. We welcome feedback
//! about the APIs, documentation, missing features, bugs, etc.
//!
//! This crate implements the per-instance credential lifecycle for
//! connecting to a Cloud SQL instance over a pinned, mutually authenticated
//! TLS channel: it fetches instance metadata and mints short-lived client
//! certificates from the SQL Admin API, assembles them into a ready-to-use
//! [`rustls::ClientConfig`], and keeps that configuration fresh ahead of
//! expiration.
//!
//! [`InstanceConnectionManager`] is the entry point. One is created per
//! instance connection name and runs for the lifetime of the process; it is
//! not a connection pool and does not open sockets itself; callers use
//! [`InstanceConnectionManager::tls_connector`] or
//! [`InstanceConnectionManager::preferred_ip`] to obtain the pieces they need
//! to dial a connection themselves.
//!
//! This crate intentionally does not provide: a command-line interface, a
//! configuration file format, an HTTP retry/backoff policy beyond a single
//! admin-API call (that belongs to [`AdminApiClient`] implementations), or an
//! OAuth2 token source (that belongs to [`AccessTokenSource`]
//! implementations). Callers supply these as abstract collaborators.

mod admin_client;
mod bundle;
mod certs;
mod instance_id;
mod key_pair;
mod manager;
mod metadata;
mod rate_limiter;
mod tls;
mod token_source;

pub mod error;

pub use admin_client::{AdminApiClient, ReqwestAdminApiClient};
pub use bundle::CredentialBundle;
pub use error::ConnectorError;
pub use governor::Quota;
pub use instance_id::InstanceId;
pub use key_pair::{KeyPair, KeyPairSource, StaticKeyPairSource};
pub use manager::{InstanceConnectionConfig, InstanceConnectionManager};
pub use metadata::{IpAddressType, Metadata};
pub use token_source::{AccessToken, AccessTokenSource, NoIamAuth};

/// Convenience alias for results returned by this crate's public API.
pub type Result<T> = std::result::Result<T, ConnectorError>;
