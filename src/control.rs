use std::time;

use super::cadence::Cadence;
use super::channel::{ChannelError, ControlChannel};
use super::lifecycle::ShutdownFlag;
use super::message::{serial, Body, DecodeError, FlowId, Message};
use super::perf_log::PerfLog;
use super::telemetry::{RequestKind, Snapshot, TelemetrySource, WindowActuator};

const INTERVAL_DEFAULT_MS: u64 = 20;

const REPLY_TIMEOUT_DEFAULT_MS: u64 = 1_000;

/// Configuration for a [`ControlLoop`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Spacing between control cycle starts, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 20
    pub interval_ms: u64,

    /// Maximum time to wait for the decision process to reply to a snapshot, in milliseconds. A
    /// cycle which times out holds the current window. `None` waits indefinitely.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub reply_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_ms: INTERVAL_DEFAULT_MS,
            reply_timeout_ms: Some(REPLY_TIMEOUT_DEFAULT_MS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid control configuration: interval_ms < 1")]
    Interval,
    #[error("invalid control configuration: reply_timeout_ms < 1")]
    ReplyTimeout,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Interval);
        }

        if self.reply_timeout_ms == Some(0) {
            return Err(ConfigError::ReplyTimeout);
        }

        Ok(())
    }

    pub fn interval(&self) -> time::Duration {
        time::Duration::from_millis(self.interval_ms)
    }

    pub fn reply_timeout(&self) -> Option<time::Duration> {
        self.reply_timeout_ms.map(time::Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid handshake reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("decision process did not reply to START")]
    Timeout,
}

/// Announces the flow to the decision process and returns the identity it assigns. The assigned
/// identity replaces `requested` for the rest of the flow's lifetime.
pub fn handshake(
    channel: &mut ControlChannel,
    requested: FlowId,
    timeout: Option<time::Duration>,
) -> Result<FlowId, HandshakeError> {
    channel.send(&Message::new(requested, Body::Start))?;
    log::info!("sent START to decision process");

    let payload = channel.receive(timeout)?.ok_or(HandshakeError::Timeout)?;
    let flow_id = serial::decode_assignment(&payload)?;

    log::info!("flow {flow_id}: decision process connection established");

    Ok(flow_id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Result of a single control cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The decision was applied.
    Applied(u32),
    /// The decision could not be applied by the transport.
    ActuatorFailed(u32),
    /// The reply could not be decoded; the window was left alone.
    DecodeFailed,
    /// No reply arrived in time; the window was left alone.
    MissedReply,
    /// Telemetry could not be read, so no request was made.
    TelemetryFailed,
    /// No decision process; the snapshot was only recorded.
    Observed,
}

/// Running totals over the lifetime of a control loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlStats {
    pub cycles: u64,
    pub applied: u64,
    pub actuator_failures: u64,
    pub decode_failures: u64,
    pub missed_replies: u64,
    pub telemetry_failures: u64,
}

/// Periodically exchanges telemetry for window decisions with the decision process.
pub struct ControlLoop<S, A> {
    // Saved configuration
    config: Config,
    // Identity stamped on every message
    flow_id: FlowId,
    // Current mode of operation
    state: State,
    // Transport telemetry and window control
    source: S,
    actuator: A,
    // Decision process connection, possibly absent
    channel: ControlChannel,
    // Optional per-cycle record
    perf_log: Option<PerfLog>,
    stats: ControlStats,
    // Set when a cycle gave up waiting; no new request goes out until that reply is settled
    reply_owed: bool,
}

impl<S, A> ControlLoop<S, A>
where
    S: TelemetrySource,
    A: WindowActuator,
{
    pub fn new(
        config: Config,
        flow_id: FlowId,
        source: S,
        actuator: A,
        channel: ControlChannel,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            flow_id,
            state: State::Idle,
            source,
            actuator,
            channel,
            perf_log: None,
            stats: Default::default(),
            reply_owed: false,
        })
    }

    pub fn with_perf_log(mut self, perf_log: PerfLog) -> Self {
        self.perf_log = Some(perf_log);
        self
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> &ControlStats {
        &self.stats
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Runs cycles on a fixed cadence until `flag` is cleared or the control channel fails. In
    /// either case END is sent (if possible) and the performance log is closed before returning.
    pub fn run(&mut self, flag: &ShutdownFlag) -> Result<ControlStats, ChannelError> {
        self.state = State::Running;

        if self.channel.is_connected() {
            log::info!(
                "flow {}: control loop running, interval {}ms",
                self.flow_id,
                self.config.interval_ms
            );
        } else {
            log::info!(
                "flow {}: no decision process, kernel algorithm keeps the window",
                self.flow_id
            );
        }

        let mut cadence = Cadence::new(time::Instant::now(), self.config.interval());

        let result = loop {
            if !flag.is_running() {
                break Ok(());
            }

            match self.cycle() {
                Ok(_) => (),
                Err(ChannelError::EndSent) => {
                    log::debug!("flow {}: END already delivered", self.flow_id);
                    break Ok(());
                }
                Err(err) => {
                    log::warn!("flow {}: control channel failed: {err}", self.flow_id);
                    break Err(err);
                }
            }

            cadence.wait();
        };

        self.stop(result.is_ok());

        result.map(|()| self.stats.clone())
    }

    /// Performs one control cycle. Only control channel failures are returned as errors; all other
    /// problems are contained within the cycle.
    ///
    /// At most one request is outstanding at a time. If the previous cycle gave up on its reply,
    /// this cycle first waits for that reply and discards it; should it still not arrive, no new
    /// request is made and the cycle counts as missed.
    pub fn cycle(&mut self) -> Result<CycleOutcome, ChannelError> {
        self.stats.cycles += 1;

        if self.reply_owed && !self.settle_owed_reply()? {
            log::warn!(
                "flow {}: previous action still outstanding, holding window",
                self.flow_id
            );
            self.stats.missed_replies += 1;
            return Ok(CycleOutcome::MissedReply);
        }

        let snapshot = match self.source.read_snapshot(RequestKind::Action) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!("flow {}: failed to read telemetry: {err}", self.flow_id);
                self.stats.telemetry_failures += 1;
                return Ok(CycleOutcome::TelemetryFailed);
            }
        };

        if !self.channel.is_connected() {
            self.record(&snapshot, snapshot.cwnd);
            return Ok(CycleOutcome::Observed);
        }

        log::trace!("flow {}: send state {:?}", self.flow_id, snapshot);

        let message = Message::new(
            self.flow_id,
            Body::Alive {
                snapshot: snapshot.clone(),
            },
        );
        self.channel.send(&message)?;

        let sent_at = time::Instant::now();

        let payload = match self.channel.receive(self.config.reply_timeout())? {
            Some(payload) => payload,
            None => {
                log::warn!(
                    "flow {}: no action within {}ms, holding window",
                    self.flow_id,
                    self.config.reply_timeout_ms.unwrap_or_default()
                );
                self.stats.missed_replies += 1;
                self.reply_owed = true;
                return Ok(CycleOutcome::MissedReply);
            }
        };

        let action = match serial::decode_action(&payload) {
            Ok(action) => action,
            Err(err) => {
                log::warn!(
                    "flow {}: failed to parse action {:?}: {err}",
                    self.flow_id,
                    String::from_utf8_lossy(&payload)
                );
                self.stats.decode_failures += 1;
                return Ok(CycleOutcome::DecodeFailed);
            }
        };

        let outcome = match self.actuator.set_window(action.cwnd) {
            Ok(()) => {
                self.stats.applied += 1;
                CycleOutcome::Applied(action.cwnd)
            }
            Err(err) => {
                log::warn!(
                    "flow {}: failed to set cwnd {}: {err}",
                    self.flow_id,
                    action.cwnd
                );
                self.stats.actuator_failures += 1;
                CycleOutcome::ActuatorFailed(action.cwnd)
            }
        };

        log::debug!(
            "flow {}: got cwnd {}, elapsed time is {}us",
            self.flow_id,
            action.cwnd,
            sent_at.elapsed().as_micros()
        );

        self.record(&snapshot, action.cwnd);

        Ok(outcome)
    }

    /// Sends an OBSERVE message carrying a fresh snapshot. No reply is expected.
    pub fn observe(&mut self, observer: u32, step: u32) -> Result<(), ChannelError> {
        let snapshot = match self.source.read_snapshot(RequestKind::Observe) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                log::warn!("flow {}: failed to read telemetry: {err}", self.flow_id);
                None
            }
        };

        let message = Message::new(
            self.flow_id,
            Body::Observe {
                observer,
                step,
                snapshot,
            },
        );

        self.channel.send(&message)
    }

    /// Waits for the reply owed to an earlier request and discards it, since it answers a stale
    /// snapshot. Returns whether the channel is clear for a new request.
    fn settle_owed_reply(&mut self) -> Result<bool, ChannelError> {
        match self.channel.receive(self.config.reply_timeout())? {
            Some(_) => {
                log::debug!("flow {}: discarding late action", self.flow_id);
                self.reply_owed = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record(&mut self, snapshot: &Snapshot, assigned_cwnd: u32) {
        if let Some(perf_log) = self.perf_log.as_mut() {
            if let Err(err) = perf_log.record(snapshot, assigned_cwnd) {
                log::warn!("flow {}: failed to write performance log: {err}", self.flow_id);
            }
        }
    }

    fn stop(&mut self, channel_usable: bool) {
        self.state = State::Stopping;

        if channel_usable {
            match self.channel.send_end(self.flow_id) {
                Ok(true) => log::info!("flow {}: sent END", self.flow_id),
                Ok(false) => (),
                Err(err) => log::warn!("flow {}: failed to send END: {err}", self.flow_id),
            }
        }

        if let Some(perf_log) = self.perf_log.take() {
            if let Err(err) = perf_log.close() {
                log::warn!("flow {}: failed to close performance log: {err}", self.flow_id);
            }
        }

        self.state = State::Stopped;

        log::info!("flow {}: control loop stopped", self.flow_id);
    }
}
