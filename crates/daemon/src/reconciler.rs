//! The reconciliation cycle and the loop that repeats it.
//!
//! A cycle walks `Idle → CheckingClientReachable → FetchingLease →
//! FetchingClientPort → InSync | Mismatched → Applying → Verifying → Done`.
//! Every failure along the way ends the cycle with a
//! [`CycleStatus::PartialFailure`]; nothing is allowed to escape, since a
//! crashed daemon also stops renewing the lease.

use crate::api::{client_port_state, extract_port, random_port_flag, ClientApi};
use crate::config::Schedule;
use crate::lease::LeaseSource;
use crate::restart::RestartHook;
use crate::verify::PortVerifier;
use common::{ClientPortState, CycleStatus, ExternalPortLease, FailureReason, ReconciliationOutcome};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    CheckingClientReachable,
    FetchingLease,
    FetchingClientPort,
    InSync,
    Mismatched,
    Applying,
    Verifying,
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    /// Probe the WebUI before doing anything else.
    pub check_reachable: bool,
    /// Write the lease port even when the client already has it.
    pub force: bool,
}

impl CycleOptions {
    pub fn one_shot() -> Self {
        Self {
            check_reachable: true,
            force: false,
        }
    }

    pub fn forced() -> Self {
        Self {
            check_reachable: true,
            force: true,
        }
    }
}

/// State carried between ticks of the continuous loop.
#[derive(Debug, Default)]
pub struct LoopState {
    pub last_known_external_port: Option<u16>,
    pub last_health_check: Option<Instant>,
}

impl LoopState {
    fn health_check_due(&self, now: Instant, every: Duration) -> bool {
        self.last_health_check
            .map_or(true, |checked| now.duration_since(checked) >= every)
    }
}

/// Read-only snapshot for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lease: Option<ExternalPortLease>,
    pub client: Option<ClientPortState>,
    pub in_sync: bool,
}

pub struct Reconciler<L, A> {
    lease: L,
    api: A,
    restart: RestartHook,
    verifier: PortVerifier,
}

impl<L, A> Reconciler<L, A>
where
    L: LeaseSource,
    A: ClientApi,
{
    pub fn new(lease: L, api: A, restart: RestartHook, verifier: PortVerifier) -> Self {
        Self {
            lease,
            api,
            restart,
            verifier,
        }
    }

    pub fn lease_source(&self) -> &L {
        &self.lease
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Run one cycle and log its outcome.
    pub async fn run_cycle(&self, options: CycleOptions) -> ReconciliationOutcome {
        let outcome = self.cycle(options).await;
        log_outcome(&outcome);
        outcome
    }

    async fn cycle(&self, options: CycleOptions) -> ReconciliationOutcome {
        let mut state = CycleState::Idle;

        if options.check_reachable {
            transition(&mut state, CycleState::CheckingClientReachable);
            if let Err(e) = self.check_reachable().await {
                warn!(error = %e, "client WebUI is unreachable, skipping cycle");
                return ReconciliationOutcome::failed(FailureReason::ClientUnreachable);
            }
        }

        transition(&mut state, CycleState::FetchingLease);
        let lease = match self.lease.renew_lease().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "could not obtain forwarded port");
                return ReconciliationOutcome::failed(FailureReason::LeaseUnavailable);
            }
        };
        let target = lease.port;
        let mut outcome = ReconciliationOutcome {
            target_port: Some(target),
            ..ReconciliationOutcome::failed(FailureReason::ClientPortUnknown)
        };

        transition(&mut state, CycleState::FetchingClientPort);
        let client = match self.api.preferences().await {
            Ok(prefs) => client_port_state(&prefs, None),
            Err(e) => {
                warn!(error = %e, "could not read client preferences");
                return outcome;
            }
        };
        let Some(current) = client.configured_port else {
            warn!("client reported no usable listening port");
            return outcome;
        };
        outcome.previous_port = Some(current);

        if current == target && !options.force {
            transition(&mut state, CycleState::InSync);
            debug!(port = current, "client port already matches forwarded port");
            outcome.status = CycleStatus::Success;
            transition(&mut state, CycleState::Done);
            return outcome;
        }

        transition(&mut state, CycleState::Mismatched);
        info!(current, target, "client port differs from forwarded port");

        transition(&mut state, CycleState::Applying);
        if client.random_port == Some(true) {
            warn!("random port mode is enabled in the client, forcing it off");
        }
        if let Err(e) = self.api.set_port(target).await {
            error!(port = target, error = %e, "failed to write client port");
            outcome.status = CycleStatus::PartialFailure(FailureReason::WriteFailed);
            return outcome;
        }
        outcome.applied = true;

        if let Err(e) = self.restart.restart().await {
            warn!(error = %e, "restart hook failed, verifying anyway");
        }

        transition(&mut state, CycleState::Verifying);
        match self.verifier.verify(&self.api, target).await {
            Ok(verified) => {
                outcome.verified = true;
                outcome.attempts = verified.attempts;
                outcome.status = CycleStatus::Success;
            }
            Err(e) => {
                outcome.attempts = e.attempts;
                outcome.status = CycleStatus::PartialFailure(FailureReason::VerificationTimeout);
                self.log_verification_failure(target, e.last_observed).await;
            }
        }
        transition(&mut state, CycleState::Done);
        outcome
    }

    async fn check_reachable(&self) -> Result<(), crate::error::ApiError> {
        self.api.authenticate().await?;
        let version = self.api.version().await?;
        debug!(%version, "client WebUI reachable");
        Ok(())
    }

    async fn log_verification_failure(&self, expected: u16, last_observed: Option<u16>) {
        let (reported, random_port) = match self.api.preferences().await {
            Ok(prefs) => (extract_port(&prefs).or(last_observed), random_port_flag(&prefs)),
            Err(e) => {
                debug!(error = %e, "diagnostic preferences read failed");
                (last_observed, None)
            }
        };
        warn!(
            expected,
            reported_port = ?reported,
            random_port = ?random_port,
            restart_configured = self.restart.is_configured(),
            "client did not confirm the new port; it may need a manual restart"
        );
    }

    /// Renew the lease and read the client port without writing anything.
    pub async fn status(&self) -> StatusReport {
        let lease = match self.lease.renew_lease().await {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!(error = %e, "could not obtain forwarded port");
                None
            }
        };

        let client = match self.api.authenticate().await {
            Ok(()) => match self.api.preferences().await {
                Ok(prefs) => {
                    let runtime = self.api.runtime_status().await.ok();
                    Some(client_port_state(&prefs, runtime.as_ref()))
                }
                Err(e) => {
                    warn!(error = %e, "could not read client preferences");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "could not log in to WebUI");
                None
            }
        };

        let in_sync = match (&lease, &client) {
            (Some(lease), Some(client)) => client.configured_port == Some(lease.port),
            _ => false,
        };
        StatusReport { lease, client, in_sync }
    }

    /// One tick of the continuous loop.
    ///
    /// The lease is renewed on every tick, even when the client is down: the
    /// gateway drops the mapping once it goes unrenewed for its lifetime.
    pub async fn tick(
        &self,
        state: &mut LoopState,
        health_interval: Duration,
    ) -> ReconciliationOutcome {
        let now = Instant::now();
        let check_reachable = state.health_check_due(now, health_interval);
        let outcome = self
            .run_cycle(CycleOptions {
                check_reachable,
                force: false,
            })
            .await;

        let unreachable =
            outcome.status == CycleStatus::PartialFailure(FailureReason::ClientUnreachable);
        if check_reachable && !unreachable {
            state.last_health_check = Some(now);
        }

        let (port, lease_lost) = if unreachable {
            self.keep_lease_alive().await
        } else {
            let lost =
                outcome.status == CycleStatus::PartialFailure(FailureReason::LeaseUnavailable);
            (outcome.target_port, lost)
        };

        match port {
            Some(port) => {
                if state.last_known_external_port != Some(port) {
                    info!(
                        previous = ?state.last_known_external_port,
                        current = port,
                        "forwarded port changed"
                    );
                }
                state.last_known_external_port = Some(port);
            }
            None if lease_lost => {
                if let Some(previous) = state.last_known_external_port.take() {
                    warn!(previous, "lease lost, forgetting last known forwarded port");
                }
            }
            None => {}
        }
        outcome
    }

    /// Renew the lease without touching the client. Returns the port, or
    /// whether the lease was lost.
    async fn keep_lease_alive(&self) -> (Option<u16>, bool) {
        match self.lease.renew_lease().await {
            Ok(lease) => {
                debug!(port = lease.port, "renewed lease while the client is unreachable");
                (Some(lease.port), false)
            }
            Err(e) => {
                warn!(error = %e, "could not renew lease while the client is unreachable");
                (None, true)
            }
        }
    }

    /// Repeat cycles until `shutdown` flips to true.
    ///
    /// The signal is only acted on between cycles, so an in-flight API call
    /// is never abandoned halfway.
    pub async fn run(&self, schedule: &Schedule, mut shutdown: watch::Receiver<bool>) -> LoopState {
        let mut state = LoopState::default();
        info!(
            interval = ?schedule.interval,
            health_interval = ?schedule.health_interval,
            "starting reconciliation loop"
        );

        loop {
            self.tick(&mut state, schedule.health_interval).await;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(schedule.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("reconciliation loop stopped");
        state
    }
}

fn transition(state: &mut CycleState, next: CycleState) {
    debug!(from = ?*state, to = ?next, "cycle transition");
    *state = next;
}

fn log_outcome(outcome: &ReconciliationOutcome) {
    match outcome.status {
        CycleStatus::Success => info!(
            previous_port = ?outcome.previous_port,
            target_port = ?outcome.target_port,
            applied = outcome.applied,
            verified = outcome.verified,
            attempts = outcome.attempts,
            "cycle succeeded"
        ),
        CycleStatus::PartialFailure(reason) => warn!(
            previous_port = ?outcome.previous_port,
            target_port = ?outcome.target_port,
            applied = outcome.applied,
            verified = outcome.verified,
            attempts = outcome.attempts,
            %reason,
            "cycle failed"
        ),
    }
}
