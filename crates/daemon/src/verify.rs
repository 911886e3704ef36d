//! Post-write verification.

use crate::api::{extract_port, ClientApi};
use crate::config::VerifyConfig;
use crate::error::VerifyError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub port: u16,
    pub attempts: u32,
}

/// Polls the client until it reports the expected port.
///
/// Preferences reflect what was configured, maindata what the session
/// actually bound; they update at different moments so either one matching
/// is enough. Polls are spaced by a fixed delay with no sleep after the
/// last attempt.
#[derive(Debug, Clone, Copy)]
pub struct PortVerifier {
    max_attempts: u32,
    delay: Duration,
}

impl PortVerifier {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &VerifyConfig) -> Self {
        Self::new(config.attempts, config.delay)
    }

    pub async fn verify<A>(&self, api: &A, expected: u16) -> Result<Verified, VerifyError>
    where
        A: ClientApi + ?Sized,
    {
        let mut last_observed = None;

        for attempt in 1..=self.max_attempts {
            let configured = match api.preferences().await {
                Ok(prefs) => extract_port(&prefs),
                Err(e) => {
                    debug!(attempt, error = %e, "preferences read failed during verification");
                    None
                }
            };
            if configured.is_some() {
                last_observed = configured;
            }
            if configured == Some(expected) {
                return Ok(Verified { port: expected, attempts: attempt });
            }

            let runtime = match api.runtime_status().await {
                Ok(status) => extract_port(&status),
                Err(e) => {
                    debug!(attempt, error = %e, "runtime status read failed during verification");
                    None
                }
            };
            if runtime == Some(expected) {
                return Ok(Verified { port: expected, attempts: attempt });
            }

            debug!(attempt, expected, ?configured, ?runtime, "port change not observed yet");
            if attempt < self.max_attempts {
                sleep(self.delay).await;
            }
        }

        Err(VerifyError {
            expected,
            last_observed,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockApi;
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn immediate_match_takes_one_attempt() {
        let api = MockApi::new(Some(51820));
        let start = Instant::now();

        let verified = PortVerifier::new(5, DELAY).verify(&api, 51820).await.unwrap();

        assert_eq!(verified, Verified { port: 51820, attempts: 1 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn nth_attempt_match_sleeps_n_minus_one_times() {
        let api = MockApi::new(Some(48392));
        api.set_port_now_with_stale_reads(51820, 3);
        let start = Instant::now();

        let verified = PortVerifier::new(5, DELAY).verify(&api, 51820).await.unwrap();

        assert_eq!(verified.attempts, 4);
        assert_eq!(start.elapsed(), DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_port_alone_is_enough() {
        let api = MockApi::new(Some(48392));
        api.state().runtime_port = Some(51820);

        let verified = PortVerifier::new(5, DELAY).verify(&api, 51820).await.unwrap();

        assert_eq!(verified.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_configured_port() {
        let api = MockApi::new(Some(48392));
        let start = Instant::now();

        let err = PortVerifier::new(5, DELAY).verify(&api, 51820).await.unwrap_err();

        assert_eq!(err.attempts, 5);
        assert_eq!(err.last_observed, Some(48392));
        assert_eq!(start.elapsed(), DELAY * 4);
        assert_eq!(api.state().preference_reads, 5);
        assert_eq!(api.state().runtime_reads, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_count_as_misses() {
        let api = MockApi::new(Some(48392));
        api.state().reachable = false;

        let err = PortVerifier::new(2, DELAY).verify(&api, 51820).await.unwrap_err();

        assert_eq!(err.last_observed, None);
        assert_eq!(err.attempts, 2);
    }
}
