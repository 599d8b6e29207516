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

//! The Refresh Orchestrator and Access Gate: the per-instance credential
//! lifecycle engine.
//!
//! One [`InstanceConnectionManager`] is created per target instance. It
//! immediately launches its first refresh, schedules every subsequent one
//! ahead of expiry, and serves the freshest bundle to callers with minimal
//! latency. It runs for the lifetime of the process; there is no explicit
//! teardown, mirroring [`token_cache`][crate]'s own perpetual refresh loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use governor::Quota;
use rustls::ClientConfig;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::admin_client::AdminApiClient;
use crate::bundle::CredentialBundle;
use crate::certs;
use crate::error::ConnectorError;
use crate::instance_id::InstanceId;
use crate::key_pair::{KeyPair, KeyPairSource};
use crate::metadata;
use crate::rate_limiter::ForceRefreshLimiter;
use crate::tls;
use crate::token_source::{AccessToken, AccessTokenSource, NoIamAuth};

type BundleResult = Result<Arc<CredentialBundle>, ConnectorError>;
type SharedBundleFuture = Shared<BoxFuture<'static, BundleResult>>;

const DEFAULT_SAFETY_BUFFER: Duration = Duration::from_secs(5 * 60);
const IAM_SAFETY_BUFFER: Duration = Duration::from_secs(55);
const FALLBACK_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Configuration for one [`InstanceConnectionManager`].
///
/// Mirrors the options-struct idiom used elsewhere in this workspace: a
/// small builder with `with_*` setters, constructed once and consumed by
/// [`InstanceConnectionManager::new`].
pub struct InstanceConnectionConfig {
    instance: InstanceId,
    key_pair_source: Arc<dyn KeyPairSource>,
    admin_client: Arc<dyn AdminApiClient>,
    access_token_source: Arc<dyn AccessTokenSource>,
    iam_auth_enabled: bool,
    safety_buffer_override: Option<Duration>,
    rate_limiter_quota_override: Option<Quota>,
}

impl std::fmt::Debug for InstanceConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConnectionConfig")
            .field("instance", &self.instance)
            .field("iam_auth_enabled", &self.iam_auth_enabled)
            .field("safety_buffer_override", &self.safety_buffer_override)
            .finish_non_exhaustive()
    }
}

impl InstanceConnectionConfig {
    /// Creates a configuration for `connection_name` with IAM database
    /// authentication disabled.
    pub fn new(
        connection_name: &str,
        key_pair_source: Arc<dyn KeyPairSource>,
        admin_client: Arc<dyn AdminApiClient>,
    ) -> Result<Self, ConnectorError> {
        Ok(InstanceConnectionConfig {
            instance: InstanceId::parse(connection_name)?,
            key_pair_source,
            admin_client,
            access_token_source: Arc::new(NoIamAuth),
            iam_auth_enabled: false,
            safety_buffer_override: None,
            rate_limiter_quota_override: None,
        })
    }

    /// Enables IAM database authentication, sourcing access tokens from
    /// `access_token_source`. This also selects the 55-second safety buffer
    /// and forbids TLS 1.2 fallback.
    pub fn with_iam_auth(mut self, access_token_source: Arc<dyn AccessTokenSource>) -> Self {
        self.access_token_source = access_token_source;
        self.iam_auth_enabled = true;
        self
    }

    /// Overrides the computed safety buffer. Intended for tests that need
    /// faster refresh cycles than production's 5-minute/55-second defaults.
    pub fn with_safety_buffer_override(mut self, buffer: Duration) -> Self {
        self.safety_buffer_override = Some(buffer);
        self
    }

    /// Overrides the forced-refresh rate limiter's quota. Intended for tests
    /// that need a faster refill than production's one-per-minute rate.
    pub fn with_rate_limiter_quota_override(mut self, quota: Quota) -> Self {
        self.rate_limiter_quota_override = Some(quota);
        self
    }
}

/// The scheduled successor to the current bundle: either a pending timer
/// that has not yet fired, or the in-flight (or already-resolved) refresh
/// that timer started.
///
/// The nesting — a timer whose firing publishes a future, rather than the
/// future itself — is what lets [`InstanceConnectionManager::force_refresh`]
/// atomically choose "pre-empt the timer" versus "attach to the refresh
/// already running" without awaiting anything while holding the state lock.
enum NextRefresh {
    Pending {
        cancel: oneshot::Sender<()>,
        started: oneshot::Receiver<SharedBundleFuture>,
    },
    Running(SharedBundleFuture),
}

struct ManagerState {
    current: SharedBundleFuture,
    /// The last resolved outcome of `current`, tracked independently of the
    /// future's own poll state so the failure-replacement rule in step 5 of
    /// the refresh algorithm can be evaluated without needing to poll
    /// `current` under the lock.
    last_result: Option<BundleResult>,
    next: NextRefresh,
}

/// The per-instance credential lifecycle engine.
///
/// Create one with [`InstanceConnectionManager::new`] per instance
/// connection name; it launches its first refresh immediately and keeps
/// itself fresh for as long as the returned `Arc` (held by its own
/// background tasks) is reachable, which in practice is the lifetime of the
/// process.
pub struct InstanceConnectionManager {
    instance: InstanceId,
    key_pair_source: Arc<dyn KeyPairSource>,
    admin_client: Arc<dyn AdminApiClient>,
    access_token_source: Arc<dyn AccessTokenSource>,
    iam_auth_enabled: bool,
    safety_buffer_override: Option<Duration>,
    limiter: ForceRefreshLimiter,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for InstanceConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConnectionManager")
            .field("instance", &self.instance)
            .field("iam_auth_enabled", &self.iam_auth_enabled)
            .finish_non_exhaustive()
    }
}

impl InstanceConnectionManager {
    /// Builds a manager for `config.instance` and launches its first
    /// refresh immediately.
    pub fn new(config: InstanceConnectionConfig) -> Arc<Self> {
        let limiter = match config.rate_limiter_quota_override {
            Some(quota) => ForceRefreshLimiter::with_quota(quota),
            None => ForceRefreshLimiter::new(),
        };

        // Placeholder state: immediately overwritten below, once `manager`
        // exists and `begin_refresh` can capture a strong `Arc<Self>`.
        let placeholder: SharedBundleFuture = futures::future::pending::<BundleResult>().boxed().shared();
        let manager = Arc::new(InstanceConnectionManager {
            instance: config.instance,
            key_pair_source: config.key_pair_source,
            admin_client: config.admin_client,
            access_token_source: config.access_token_source,
            iam_auth_enabled: config.iam_auth_enabled,
            safety_buffer_override: config.safety_buffer_override,
            limiter,
            state: Mutex::new(ManagerState {
                current: placeholder.clone(),
                last_result: None,
                next: NextRefresh::Running(placeholder),
            }),
        });

        let first_refresh = manager.clone().begin_refresh();
        {
            let mut state = manager.state.lock().unwrap();
            state.current = first_refresh.clone();
            state.next = NextRefresh::Running(first_refresh.clone());
        }
        // Drive the refresh on the executor now rather than lazily on the
        // first caller's poll: the manager runs its lifecycle independent of
        // whether anything is currently awaiting a bundle.
        tokio::spawn(first_refresh);

        manager
    }

    /// `getTlsConfig()`: blocks until the first successful refresh, then
    /// returns immediately thereafter.
    pub async fn tls_config(&self) -> Result<Arc<ClientConfig>, ConnectorError> {
        let fut = self.state.lock().unwrap().current.clone();
        let bundle = fut.await?;
        Ok(bundle.tls_config())
    }

    /// `getPreferredIp`: returns the first address among `preferred_types`
    /// present on the current bundle.
    pub async fn preferred_ip(&self, preferred_types: &[&str]) -> Result<String, ConnectorError> {
        let fut = self.state.lock().unwrap().current.clone();
        let bundle = fut.await?;
        for label in preferred_types {
            if let Some(ip) = bundle.metadata().ip_address(label) {
                return Ok(ip.to_string());
            }
        }
        Err(ConnectorError::NoMatchingIp {
            connection_name: self.instance.connection_name(),
            requested: preferred_types.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// `createSslSocket()`: an unconnected [`tokio_rustls::TlsConnector`]
    /// configured from the current bundle. Dialing the TCP stream and
    /// driving the handshake is the caller's responsibility.
    pub async fn tls_connector(&self) -> Result<tokio_rustls::TlsConnector, ConnectorError> {
        let config = self.tls_config().await?;
        Ok(tokio_rustls::TlsConnector::from(config))
    }

    /// `forceRefresh()`: pre-empts the scheduled timer if it has not yet
    /// fired, or attaches to the refresh already in flight if it has.
    ///
    /// Always returns `true`: per the design note this preserves, the
    /// contract never exercises a `false` ("rate-limited" or
    /// "already-in-progress") return. Rate limiting is enforced inside the
    /// refresh itself, not here.
    pub async fn force_refresh(self: &Arc<Self>) -> bool {
        // What to do once we're done touching `state`. Building the new
        // refresh's future never awaits (it only constructs and `.shared()`s
        // a boxed async block), so the cancel-succeeds branch below does it
        // while still holding the lock — that is what keeps this whole
        // decision atomic with respect to a second, concurrent
        // `force_refresh()`.
        enum Next {
            Spawn(SharedBundleFuture),
            AttachPending(oneshot::Receiver<SharedBundleFuture>),
        }

        let next = {
            let mut state = self.state.lock().unwrap();
            let placeholder = NextRefresh::Running(state.current.clone());
            match std::mem::replace(&mut state.next, placeholder) {
                NextRefresh::Pending { cancel, started } => {
                    if cancel.send(()).is_ok() {
                        // The timer had not yet fired: pre-empt it and
                        // publish a new refresh before releasing the lock,
                        // so no concurrent `force_refresh` can observe the
                        // placeholder above and wrongly treat it as current.
                        let fut = self.clone().begin_refresh();
                        state.current = fut.clone();
                        state.next = NextRefresh::Running(fut.clone());
                        Next::Spawn(fut)
                    } else {
                        // The timer had already fired; we'll attach to
                        // whatever it started once it tells us, which
                        // requires awaiting outside the lock.
                        Next::AttachPending(started)
                    }
                }
                NextRefresh::Running(fut) => {
                    // Already running (or itself a prior forced refresh
                    // that's still being driven); attach without spawning.
                    state.current = fut.clone();
                    state.next = NextRefresh::Running(fut);
                    return true;
                }
            }
        };

        match next {
            Next::Spawn(fut) => {
                // Driven on the executor now rather than left to whichever
                // caller next happens to poll it.
                tokio::spawn(fut);
            }
            Next::AttachPending(started) => {
                if let Ok(fut) = started.await {
                    let mut state = self.state.lock().unwrap();
                    state.current = fut.clone();
                    state.next = NextRefresh::Running(fut);
                }
            }
        }

        true
    }

    /// Starts a refresh now and returns the cloneable future representing
    /// it. The future, once polled to completion, performs the full
    /// mutex-guarded bookkeeping of step 4/5 of the refresh algorithm
    /// (bundle replacement and rescheduling) before resolving.
    fn begin_refresh(self: Arc<Self>) -> SharedBundleFuture {
        let fut: BoxFuture<'static, BundleResult> = Box::pin(async move {
            self.limiter.acquire().await;
            let result = self.execute_refresh_steps().await;
            self.on_refresh_complete(result.clone());
            result
        });
        fut.shared()
    }

    /// Schedules a refresh to begin `after` from now, returning the
    /// [`NextRefresh::Pending`] handle that guards it. `forceRefresh` may
    /// cancel this before it fires.
    fn schedule_timer(self: &Arc<Self>, after: Duration) -> NextRefresh {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();
        let manager = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => return,
                _ = tokio::time::sleep(after) => {}
            }

            let fut = manager.clone().begin_refresh();
            {
                let mut state = manager.state.lock().unwrap();
                state.next = NextRefresh::Running(fut.clone());
            }
            // Publish to any `force_refresh` that raced the cancellation
            // check above and is waiting on `started`.
            let _ = started_tx.send(fut.clone());
            let _ = fut.await;
        });

        NextRefresh::Pending {
            cancel: cancel_tx,
            started: started_rx,
        }
    }

    /// Steps 2 and 3 of the refresh algorithm: fetch metadata and mint an
    /// ephemeral certificate in parallel, then assemble the TLS config.
    async fn execute_refresh_steps(&self) -> BundleResult {
        let connection_name = self.instance.connection_name();

        let metadata_fut = metadata::fetch_metadata(self.admin_client.as_ref(), &self.instance);
        let cert_fut = self.mint_certificate(&connection_name);

        let (metadata_result, cert_result) = tokio::join!(metadata_fut, cert_fut);
        let metadata = metadata_result?;
        let (key_pair, access_token, ephemeral_cert_der) = cert_result?;

        let cert_not_after = certs::certificate_not_after(&connection_name, &ephemeral_cert_der)?;
        let expires_at = match &access_token {
            Some(token) if token.expires_at() < cert_not_after => token.expires_at(),
            _ => cert_not_after,
        };

        let tls_config = tls::assemble_client_config(
            &connection_name,
            &key_pair,
            ephemeral_cert_der,
            metadata.server_ca_certificate().clone(),
            self.iam_auth_enabled,
        )?;

        Ok(Arc::new(CredentialBundle::new(metadata, tls_config, expires_at)))
    }

    async fn mint_certificate(
        &self,
        connection_name: &str,
    ) -> Result<(KeyPair, Option<AccessToken>, rustls_pki_types::CertificateDer<'static>), ConnectorError> {
        let key_pair = self.key_pair_source.key_pair().await?;

        let access_token = if self.iam_auth_enabled {
            self.access_token_source.refresh().await?;
            Some(self.access_token_source.access_token().await?)
        } else {
            None
        };

        let der = certs::mint_ephemeral_certificate(
            self.admin_client.as_ref(),
            connection_name,
            self.instance.project(),
            &self.instance.regional_instance(),
            &key_pair,
            access_token.as_ref(),
        )
        .await?;

        Ok((key_pair, access_token, der))
    }

    /// Step 4/5: on success, unconditionally replace `current`; on failure,
    /// replace it immediately if the error is non-transient (it will not
    /// self-heal on retry), otherwise only if the previously-known bundle is
    /// itself unusable. Either way, reschedule immediately (the
    /// forced-refresh limiter is the effective backoff on repeated failure).
    fn on_refresh_complete(self: &Arc<Self>, result: BundleResult) {
        let next_delay = match &result {
            Ok(bundle) => self.safety_buffer_delay(bundle),
            Err(err) => {
                tracing::warn!(instance = %self.instance, error = %err, "credential refresh failed");
                Duration::ZERO
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            let should_replace = match &result {
                Ok(_) => true,
                // A non-transient error (bad metadata, a cert that won't
                // parse, TLS assembly failure) will not self-heal on the
                // next retry, so callers should see it now rather than keep
                // riding a bundle that is merely not-yet-expired.
                Err(err) if !err.is_transient() => true,
                Err(_) => match &state.last_result {
                    Some(Ok(bundle)) => bundle.is_expired(),
                    Some(Err(_)) => true,
                    None => true,
                },
            };
            if should_replace {
                state.current = futures::future::ready(result.clone()).boxed().shared();
                state.last_result = Some(result);
            }
        }

        let next = self.schedule_timer(next_delay);
        let mut state = self.state.lock().unwrap();
        state.next = next;
    }

    fn safety_buffer_delay(&self, bundle: &CredentialBundle) -> Duration {
        let safety_buffer = self.safety_buffer_override.unwrap_or(if self.iam_auth_enabled {
            IAM_SAFETY_BUFFER
        } else {
            DEFAULT_SAFETY_BUFFER
        });
        let safety_buffer = time::Duration::try_from(safety_buffer).unwrap_or(time::Duration::ZERO);

        let now = OffsetDateTime::now_utc();
        let candidate = bundle.expires_at() - safety_buffer;
        if candidate > now {
            return (candidate - now).try_into().unwrap_or(Duration::ZERO);
        }

        let fallback = bundle.expires_at() - time::Duration::seconds(FALLBACK_SAFETY_MARGIN.as_secs() as i64);
        if fallback > now {
            return (fallback - now).try_into().unwrap_or(Duration::ZERO);
        }

        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_client::{ConnectSettings, EphemeralCert, IpMapping, ServerCaCert};
    use crate::key_pair::StaticKeyPairSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_key_pair() -> KeyPair {
        KeyPair::from_der(vec![1, 2, 3, 4], vec![5, 6, 7, 8])
    }

    struct StubAdminClient {
        region: String,
        backend_type: String,
        ip_addresses: Vec<(String, String)>,
        metadata_calls: AtomicUsize,
        cert_calls: AtomicUsize,
        fail_with_access_not_configured: bool,
    }

    impl StubAdminClient {
        fn happy(region: &str) -> Self {
            StubAdminClient {
                region: region.to_string(),
                backend_type: "SECOND_GEN".to_string(),
                ip_addresses: vec![("PRIMARY".to_string(), "1.2.3.4".to_string())],
                metadata_calls: AtomicUsize::new(0),
                cert_calls: AtomicUsize::new(0),
                fail_with_access_not_configured: false,
            }
        }
    }

    #[async_trait]
    impl AdminApiClient for StubAdminClient {
        async fn connect_settings(
            &self,
            _project: &str,
            _regional_instance: &str,
        ) -> Result<ConnectSettings, ConnectorError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_access_not_configured {
                return Err(ConnectorError::ApiDisabled {
                    project: "p".to_string(),
                    console_url: "https://console.cloud.google.com/apis/api/sqladmin/overview?project=p".to_string(),
                });
            }
            Ok(ConnectSettings {
                region: self.region.clone(),
                backend_type: self.backend_type.clone(),
                ip_addresses: self
                    .ip_addresses
                    .iter()
                    .map(|(kind, ip)| IpMapping {
                        kind: kind.clone(),
                        ip_address: ip.clone(),
                    })
                    .collect(),
                server_ca_cert: ServerCaCert {
                    cert: crate::certs::SELF_SIGNED_CA_PEM_FOR_TESTS.to_string(),
                },
            })
        }

        async fn generate_ephemeral_cert(
            &self,
            _project: &str,
            _regional_instance: &str,
            _public_key_pem: &str,
            _access_token: Option<&str>,
        ) -> Result<EphemeralCert, ConnectorError> {
            self.cert_calls.fetch_add(1, Ordering::SeqCst);
            Ok(EphemeralCert {
                cert: crate::certs::SELF_SIGNED_CA_PEM_FOR_TESTS.to_string(),
            })
        }
    }

    struct StaticAccessTokenSource {
        expires_at: OffsetDateTime,
    }

    #[async_trait]
    impl AccessTokenSource for StaticAccessTokenSource {
        async fn refresh(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn access_token(&self) -> Result<AccessToken, ConnectorError> {
            Ok(AccessToken::new("token-value", self.expires_at))
        }
    }

    #[tokio::test]
    async fn scenario_a_happy_path_preferred_ip() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "my-proj:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin,
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);

        let ip = manager.preferred_ip(&["PRIMARY"]).await.unwrap();
        assert_eq!(ip, "1.2.3.4");
    }

    #[tokio::test]
    async fn scenario_c_validation_error_surfaces() {
        let admin = Arc::new(StubAdminClient::happy("us-west1"));
        let config = InstanceConnectionConfig::new(
            "my-proj:us-east1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin,
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);

        let err = manager.preferred_ip(&["PRIMARY"]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Validation { .. }));
    }

    #[tokio::test]
    async fn scenario_e_api_disabled_surfaces_console_url() {
        let mut admin = StubAdminClient::happy("us-central1");
        admin.fail_with_access_not_configured = true;
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            Arc::new(admin),
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);

        let err = manager.preferred_ip(&["PRIMARY"]).await.unwrap_err();
        match err {
            ConnectorError::ApiDisabled { console_url, .. } => {
                assert!(console_url.contains("https://console.cloud.google.com/apis/api/sqladmin/overview?project=p"));
            }
            other => panic!("expected ApiDisabled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn property_6_ip_preference_order() {
        let mut admin = StubAdminClient::happy("us-central1");
        admin.ip_addresses = vec![
            ("PRIMARY".to_string(), "1.1.1.1".to_string()),
            ("PRIVATE".to_string(), "10.0.0.1".to_string()),
        ];
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            Arc::new(admin),
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);

        assert_eq!(manager.preferred_ip(&["PRIVATE", "PRIMARY"]).await.unwrap(), "10.0.0.1");
        assert_eq!(manager.preferred_ip(&["PSC", "PRIMARY"]).await.unwrap(), "1.1.1.1");
        let err = manager.preferred_ip(&["PSC"]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NoMatchingIp { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_d_iam_expiry_precedence_and_schedule() {
        let admin = StubAdminClient::happy("us-central1");
        let token_expiry = OffsetDateTime::now_utc() + time::Duration::minutes(30);

        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            Arc::new(admin),
        )
        .unwrap()
        .with_iam_auth(Arc::new(StaticAccessTokenSource {
            expires_at: token_expiry,
        }));

        let manager = InstanceConnectionManager::new(config);
        manager.tls_config().await.unwrap();

        let expires_at = {
            let state = manager.state.lock().unwrap();
            state.last_result.clone().unwrap().unwrap().expires_at()
        };
        assert_eq!(expires_at, token_expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_attaches_to_in_flight_refresh_without_extra_api_calls() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin.clone(),
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);

        manager.tls_config().await.unwrap();
        let metadata_calls_before = admin.metadata_calls.load(Ordering::SeqCst);
        let cert_calls_before = admin.cert_calls.load(Ordering::SeqCst);

        let (a, b) = tokio::join!(manager.force_refresh(), manager.force_refresh());
        assert!(a);
        assert!(b);
        manager.tls_config().await.unwrap();

        // At most one additional metadata call and one additional cert call
        // result from two concurrent forced refreshes landing on the same
        // scheduled/in-flight refresh (property 2).
        let metadata_calls_after = admin.metadata_calls.load(Ordering::SeqCst);
        let cert_calls_after = admin.cert_calls.load(Ordering::SeqCst);
        assert!(metadata_calls_after - metadata_calls_before <= 1);
        assert!(cert_calls_after - cert_calls_before <= 1);
    }

    #[tokio::test]
    async fn safety_buffer_delay_clamps_near_expiry() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin,
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);
        manager.tls_config().await.unwrap();

        let template = manager.state.lock().unwrap().last_result.clone().unwrap().unwrap();
        let with_expiry = |expires_at| CredentialBundle::new(template.metadata().clone(), template.tls_config(), expires_at);

        // Comfortably ahead of expiry: delay is expires_at - 5 minutes.
        let far = with_expiry(OffsetDateTime::now_utc() + time::Duration::minutes(10));
        let delay = manager.safety_buffer_delay(&far);
        assert!(delay > Duration::from_secs(4 * 60) && delay <= Duration::from_secs(5 * 60));

        // Inside the 5-minute buffer but more than 5 seconds out: clamps to
        // expires_at - 5s.
        let near = with_expiry(OffsetDateTime::now_utc() + time::Duration::minutes(2));
        let delay = manager.safety_buffer_delay(&near);
        assert!(delay > Duration::from_secs(60) && delay < Duration::from_secs(2 * 60));

        // Already within 5 seconds of expiry: clamps to zero.
        let imminent = with_expiry(OffsetDateTime::now_utc() + time::Duration::seconds(2));
        let delay = manager.safety_buffer_delay(&imminent);
        assert_eq!(delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn non_transient_failure_replaces_current_even_if_still_valid() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin,
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);
        manager.tls_config().await.unwrap();
        let valid_bundle = manager.state.lock().unwrap().last_result.clone().unwrap().unwrap();
        assert!(!valid_bundle.is_expired(), "fixture bundle must still be valid");

        let validation_error = ConnectorError::validation("p:us-central1:db1", "region mismatch");
        manager.on_refresh_complete(Err(validation_error));

        let err = manager.tls_config().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Validation { .. }));
    }

    #[tokio::test]
    async fn transient_failure_keeps_still_valid_bundle() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin,
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);
        manager.tls_config().await.unwrap();
        let valid_bundle = manager.state.lock().unwrap().last_result.clone().unwrap().unwrap();
        assert!(!valid_bundle.is_expired(), "fixture bundle must still be valid");

        let transient_error = ConnectorError::refresh_failed("p:us-central1:db1", std::io::Error::other("network blip"));
        manager.on_refresh_complete(Err(transient_error));

        let ip = manager.preferred_ip(&["PRIMARY"]).await.unwrap();
        assert_eq!(ip, "1.2.3.4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_force_refresh_calls_never_corrupt_state() {
        let admin = Arc::new(StubAdminClient::happy("us-central1"));
        let config = InstanceConnectionConfig::new(
            "p:us-central1:db1",
            Arc::new(StaticKeyPairSource::new(test_key_pair())),
            admin.clone(),
        )
        .unwrap();
        let manager = InstanceConnectionManager::new(config);
        manager.tls_config().await.unwrap();

        let metadata_calls_before = admin.metadata_calls.load(Ordering::SeqCst);

        // Fire many `force_refresh()` calls from distinct tasks on a real
        // multi-threaded runtime so they genuinely race on `state` instead of
        // running to completion one at a time the way a single-threaded
        // `tokio::join!` would.
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.force_refresh().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        manager.tls_config().await.unwrap();

        // All sixteen forced refreshes must collapse onto the single refresh
        // that pre-empted the scheduled timer; none may have spawned a
        // redundant refresh of their own.
        let metadata_calls_after = admin.metadata_calls.load(Ordering::SeqCst);
        assert_eq!(metadata_calls_after - metadata_calls_before, 1);

        // Nor may any of them have left `current`/`next` pointing at
        // different futures — had one raced into the old stale placeholder
        // (the bug this test guards against), it would have republished a
        // `current` that disagreed with `next`.
        let (current, next) = {
            let state = manager.state.lock().unwrap();
            let next = match &state.next {
                NextRefresh::Running(fut) => fut.clone(),
                NextRefresh::Pending { .. } => {
                    panic!("expected the forced refresh to still be published as Running")
                }
            };
            (state.current.clone(), next)
        };
        let current_bundle = current.await.unwrap();
        let next_bundle = next.await.unwrap();
        assert!(
            Arc::ptr_eq(&current_bundle, &next_bundle),
            "current and next must agree on the same refresh after concurrent force_refresh calls"
        );
    }
}
