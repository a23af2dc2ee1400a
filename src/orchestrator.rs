use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::Classifier;
use crate::config::SortbinConfig;
use crate::detector::TriggerDetector;
use crate::discovery::ControllerDirectory;
use crate::error::{Result, SortbinError};
use crate::gateway::{CommandGateway, Compartment};
use crate::telemetry::{TelemetryRecord, TelemetrySink};

/// The orchestrator's position in the control loop. Logged on every
/// transition; nothing else reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Ready,
    Polling,
    Classifying,
    Actuating,
    Recovering,
    Restarting,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::Ready => "ready",
            SessionState::Polling => "polling",
            SessionState::Classifying => "classifying",
            SessionState::Actuating => "actuating",
            SessionState::Recovering => "recovering",
            SessionState::Restarting => "restarting",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How one triggered sort cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Item routed and logged; the retry counter resets.
    Success,
    /// The cycle was abandoned without touching the hardware; does not
    /// count against the retry budget.
    Forfeited,
    /// A failure worth retrying in place.
    RetryableFailure(SortbinError),
    /// A failure no retry or restart will fix.
    FatalFailure(SortbinError),
}

/// Why a session ended.
enum SessionEnd {
    Restart,
    Cancelled,
    Fatal(SortbinError),
}

/// Why trigger polling stopped.
enum PollOutcome {
    Triggered,
    Cancelled,
    Fault(SortbinError),
}

/// Drives the whole appliance: discovery, trigger polling, classification,
/// actuation, and recovery, as one sequential loop.
///
/// Everything here is single-threaded by construction; device I/O blocks
/// with per-call deadlines, and cancellation is observed at state
/// boundaries, never mid-command.
pub struct Orchestrator {
    config: SortbinConfig,
    directory: ControllerDirectory,
    detector: TriggerDetector,
    classifier: Box<dyn Classifier>,
    telemetry: Box<dyn TelemetrySink>,
    cancel: CancellationToken,
    state: SessionState,
    retry_count: u32,
}

impl Orchestrator {
    pub fn new(
        config: SortbinConfig,
        directory: ControllerDirectory,
        detector: TriggerDetector,
        classifier: Box<dyn Classifier>,
        telemetry: Box<dyn TelemetrySink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            directory,
            detector,
            classifier,
            telemetry,
            cancel,
            state: SessionState::Idle,
            retry_count: 0,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Run sessions until cancelled or a fatal error surfaces.
    ///
    /// Each iteration is one session: discover and bind both controllers,
    /// then sort until something forces a restart. A restart drops the
    /// gateway (closing both ports), waits, and rediscovers from scratch.
    pub async fn run(&mut self) -> Result<()> {
        let restart_delay = Duration::from_millis(self.config.orchestrator.restart_delay_ms);

        loop {
            if self.cancel.is_cancelled() {
                self.enter(SessionState::Terminated);
                return Ok(());
            }

            self.enter(SessionState::Discovering);
            let bindings = match self.directory.acquire() {
                Ok(bindings) => bindings,
                Err(e) if self.config.orchestrator.wait_for_hardware => {
                    warn!(error = %e, "discovery failed, waiting for hardware");
                    if !self.sleep(restart_delay).await {
                        self.enter(SessionState::Terminated);
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    self.enter(SessionState::Terminated);
                    return Err(e.into());
                }
            };

            let mut gateway = CommandGateway::new(bindings, &self.config.serial);
            info!(
                stepper = gateway.stepper_port(),
                mechanism = gateway.mechanism_port(),
                "session established"
            );

            match self.run_session(&mut gateway).await {
                SessionEnd::Restart => {
                    self.enter(SessionState::Restarting);
                    self.retry_count = 0;
                    drop(gateway);
                    self.detector.release();
                    if !self.sleep(restart_delay).await {
                        self.enter(SessionState::Terminated);
                        return Ok(());
                    }
                }
                SessionEnd::Cancelled => {
                    self.detector.release();
                    self.enter(SessionState::Terminated);
                    return Ok(());
                }
                SessionEnd::Fatal(e) => {
                    self.detector.release();
                    self.enter(SessionState::Terminated);
                    return Err(e);
                }
            }
        }
    }

    /// Sort items over an established gateway until the session ends.
    async fn run_session(&mut self, gateway: &mut CommandGateway) -> SessionEnd {
        let retry_delay = Duration::from_millis(self.config.orchestrator.retry_delay_ms);
        let cooldown = Duration::from_millis(self.config.orchestrator.cycle_cooldown_ms);

        self.enter(SessionState::Ready);
        if let Err(e) = self.detector.capture_reference() {
            let e = SortbinError::from(e);
            error!(error = %e, "failed to capture reference frame");
            return if e.is_recoverable() {
                SessionEnd::Restart
            } else {
                SessionEnd::Fatal(e)
            };
        }

        loop {
            if self.cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }

            self.enter(SessionState::Polling);
            match self.poll_until_trigger().await {
                PollOutcome::Triggered => {}
                PollOutcome::Cancelled => return SessionEnd::Cancelled,
                PollOutcome::Fault(e) if e.is_recoverable() => {
                    error!(error = %e, "detection fault, restarting session");
                    return SessionEnd::Restart;
                }
                PollOutcome::Fault(e) => return SessionEnd::Fatal(e),
            }

            match self.run_cycle(gateway) {
                CycleOutcome::Success => {
                    self.retry_count = 0;
                    if !self.sleep(cooldown).await {
                        return SessionEnd::Cancelled;
                    }
                }
                CycleOutcome::Forfeited => {
                    // Nothing was actuated; go straight back to polling.
                }
                CycleOutcome::RetryableFailure(e) => {
                    self.enter(SessionState::Recovering);
                    self.retry_count += 1;
                    warn!(
                        error = %e,
                        attempt = self.retry_count,
                        max = self.config.orchestrator.max_retries,
                        "cycle failed"
                    );
                    if self.retry_count >= self.config.orchestrator.max_retries {
                        warn!("retry budget exhausted, restarting session");
                        return SessionEnd::Restart;
                    }
                    if !self.sleep(retry_delay).await {
                        return SessionEnd::Cancelled;
                    }
                }
                CycleOutcome::FatalFailure(e) => {
                    error!(error = %e, "unrecoverable cycle failure");
                    return SessionEnd::Fatal(e);
                }
            }
        }
    }

    /// Poll the detector until it confirms a trigger.
    async fn poll_until_trigger(&mut self) -> PollOutcome {
        let interval = Duration::from_millis(self.config.detector.poll_interval_ms);

        loop {
            if self.cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            match self.detector.detect(self.config.detector.change_threshold) {
                Ok(true) => return PollOutcome::Triggered,
                Ok(false) => {
                    if !self.sleep(interval).await {
                        return PollOutcome::Cancelled;
                    }
                }
                Err(e) => return PollOutcome::Fault(e.into()),
            }
        }
    }

    /// One triggered cycle: capture, classify, actuate, log.
    fn run_cycle(&mut self, gateway: &mut CommandGateway) -> CycleOutcome {
        self.enter(SessionState::Classifying);

        let jpeg = match self.detector.capture_still() {
            Ok(jpeg) => jpeg,
            Err(e) => return CycleOutcome::RetryableFailure(e.into()),
        };

        let classification = match self.classifier.classify(&jpeg) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "classification failed, forfeiting cycle");
                return CycleOutcome::Forfeited;
            }
        };

        self.enter(SessionState::Actuating);
        let compartment = match Compartment::for_category(&classification.category) {
            Some(compartment) => compartment,
            None => {
                return CycleOutcome::RetryableFailure(SortbinError::UnmappedCategory {
                    category: classification.category,
                })
            }
        };

        if let Err(e) = gateway.run_compaction() {
            return CycleOutcome::RetryableFailure(e.into());
        }
        if let Err(e) = gateway.open_compartment(compartment) {
            return CycleOutcome::RetryableFailure(e.into());
        }

        let levels = match gateway.poll_sensors() {
            Ok(levels) => levels,
            Err(e) => return CycleOutcome::RetryableFailure(e.into()),
        };
        if let Some(reading) = &levels {
            if reading.max_level() > self.config.orchestrator.fill_threshold {
                warn!(
                    levels = %reading,
                    threshold = self.config.orchestrator.fill_threshold,
                    "fill threshold exceeded, flushing all compartments"
                );
                if let Err(e) = gateway.flush_all() {
                    return CycleOutcome::RetryableFailure(e.into());
                }
            }
        }

        if let Err(e) = gateway.restart_mechanism() {
            return CycleOutcome::RetryableFailure(e.into());
        }

        // Telemetry is best-effort: a write failure never undoes a sorted
        // item.
        let record = TelemetryRecord::now(levels, classification);
        if let Err(e) = self.telemetry.append(&record) {
            error!(error = %e, "failed to write telemetry record");
        }

        CycleOutcome::Success
    }

    fn enter(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "state transition");
            self.state = state;
        }
    }

    /// Sleep raced against cancellation; false means cancelled.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
