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

//! A per-manager token-bucket rate limiter protecting the admin-API quota.
//!
//! Every refresh — scheduled or forced — acquires one permit here before
//! issuing any admin-API call, per the Refresh Orchestrator's contract. The
//! limiter is per-manager, not process-wide: it bounds the API load of one
//! instance's refresh loop, nothing more.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};

/// Steady-state refill rate: one token per 60 seconds, burst capacity one.
const REFILL_PERIOD: Duration = Duration::from_secs(60);

pub(crate) struct ForceRefreshLimiter {
    limiter: RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>,
}

impl ForceRefreshLimiter {
    pub(crate) fn new() -> Self {
        Self::with_quota(Quota::with_period(REFILL_PERIOD)
            .expect("REFILL_PERIOD is nonzero")
            .allow_burst(NonZeroU32::new(1).expect("1 is nonzero")))
    }

    /// Builds a limiter with a caller-supplied quota, for tests that need a
    /// faster refill than the production one-per-minute rate.
    pub(crate) fn with_quota(quota: Quota) -> Self {
        ForceRefreshLimiter {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Blocks (without spinning — this yields the executor) until a token
    /// bucket permit is available, then consumes it.
    pub(crate) async fn acquire(&self) {
        loop {
            match self.limiter.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
