use std::io;
use std::net;
use std::path::PathBuf;
use std::thread;
use std::time;

use super::channel::{ChannelError, ControlChannel, EndHandle};
use super::control::{self, ControlLoop, ControlStats};
use super::data::{DataLoop, DataLoopExit};
use super::flow;
use super::lifecycle::{Event, Lifecycle, Outcome};
use super::message::FlowId;
use super::perf_log::PerfLog;

const CONGESTION_CONTROL_DEFAULT: &str = "cubic";

/// Configuration for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Receiver address.
    pub ip: String,

    /// Receiver port.
    pub port: u16,

    /// Kernel congestion control algorithm for the flow.
    ///
    /// Default value: cubic
    pub congestion_control: String,

    /// Control loop settings.
    pub control: control::Config,

    /// Externally supplied flow identity. Overridden by the decision process when one is used.
    pub flow_id: Option<u32>,

    /// Path of the performance log, if one should be written.
    pub perf_log: Option<PathBuf>,

    /// Path of the decision process socket. Without one, the kernel algorithm keeps control of
    /// the window.
    pub decision_socket: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new<S: Into<String>>(ip: S, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            congestion_control: CONGESTION_CONTROL_DEFAULT.into(),
            control: Default::default(),
            flow_id: None,
            perf_log: None,
            decision_socket: None,
        }
    }

    /// Checks every setting which can be checked without touching the network, and returns the
    /// resolved receiver address.
    pub fn validate(&self) -> Result<net::SocketAddr, Error> {
        let ip: net::IpAddr = self
            .ip
            .parse()
            .map_err(|_| Error::Address(self.ip.clone()))?;

        if self.port == 0 {
            return Err(Error::Address(format!("{}:0", self.ip)));
        }

        if self.congestion_control.is_empty() {
            return Err(Error::CongestionControl(self.congestion_control.clone()));
        }

        self.control.validate()?;

        Ok(net::SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid receiver address {0:?}")]
    Address(String),
    #[error("invalid congestion control algorithm {0:?}")]
    CongestionControl(String),
    #[error(transparent)]
    Control(#[from] control::ConfigError),
    #[error("failed to connect to decision process at {path:?}: {source}")]
    DecisionProcess { path: PathBuf, source: io::Error },
    #[error("handshake with decision process failed: {0}")]
    Handshake(#[from] control::HandshakeError),
    #[error("failed to set up flow to {addr} using {algorithm:?}: {source}")]
    Flow {
        addr: net::SocketAddr,
        algorithm: String,
        source: io::Error,
    },
    #[error("{path:?}: error opening for writing: {source}")]
    PerfLog { path: PathBuf, source: io::Error },
    #[error("failed to start client: {0}")]
    Io(#[from] io::Error),
}

type ControlResult = Result<ControlStats, ChannelError>;

type FlowControlLoop = ControlLoop<flow::FlowControl, flow::FlowWindow>;

/// A running flow: the control and data loops plus the lifecycle controller supervising them.
pub struct Client {
    flow_id: FlowId,
    lifecycle: Lifecycle,
    end_handle: Option<EndHandle>,
    control_thread: thread::JoinHandle<ControlResult>,
    data_thread: thread::JoinHandle<DataLoopExit>,
}

impl Client {
    /// Performs startup in order (decision process handshake, flow connection, algorithm
    /// selection, performance log) and spawns both loops. Any failure here is fatal and is
    /// reported before either loop starts.
    pub fn start(config: ClientConfig, lifecycle: Lifecycle) -> Result<Self, Error> {
        let addr = config.validate()?;

        let requested_id = FlowId(config.flow_id.unwrap_or_default());

        if config.flow_id.is_some() {
            log::info!("flow id: {requested_id}");
        }

        let (mut channel, flow_id) = match &config.decision_socket {
            Some(path) => {
                let mut channel =
                    ControlChannel::connect(path).map_err(|source| Error::DecisionProcess {
                        path: path.clone(),
                        source,
                    })?;
                let flow_id =
                    control::handshake(&mut channel, requested_id, config.control.reply_timeout())?;
                (channel, flow_id)
            }
            None => (ControlChannel::disconnected(), requested_id),
        };

        let (control_loop, end_handle, data_loop) =
            match Self::prepare_loops(&config, addr, &mut channel, flow_id) {
                Ok(parts) => parts,
                Err(err) => {
                    // The decision process already knows about this flow
                    let _ = channel.send_end(flow_id);
                    return Err(err);
                }
            };

        Self::spawn(flow_id, lifecycle, control_loop, end_handle, data_loop)
    }

    fn prepare_loops(
        config: &ClientConfig,
        addr: net::SocketAddr,
        channel: &mut ControlChannel,
        flow_id: FlowId,
    ) -> Result<(FlowControlLoop, Option<EndHandle>, DataLoop<flow::PayloadTx>), Error> {
        let algorithm = &config.congestion_control;

        let (payload_tx, flow_control) =
            flow::connect(addr, algorithm).map_err(|source| Error::Flow {
                addr,
                algorithm: algorithm.clone(),
                source,
            })?;

        log::debug!("flow {flow_id}: set congestion control to {algorithm}");

        if channel.is_connected() {
            match flow_control.enable_external_control() {
                Ok(()) => log::debug!("flow {flow_id}: external window control enabled"),
                Err(err) => log::warn!(
                    "flow {flow_id}: failed to enable external window control: {err}; \
                     window writes will be rejected"
                ),
            }
        }

        let perf_log = match &config.perf_log {
            Some(path) => Some(PerfLog::create(path).map_err(|source| Error::PerfLog {
                path: path.clone(),
                source,
            })?),
            None => None,
        };

        let end_handle = if channel.is_connected() {
            Some(channel.end_handle(flow_id)?)
        } else {
            None
        };

        let window = flow_control.window();

        // The control loop takes the channel over from here on
        let channel = std::mem::replace(channel, ControlChannel::disconnected());

        let mut control_loop =
            ControlLoop::new(config.control.clone(), flow_id, flow_control, window, channel)?;

        if let Some(perf_log) = perf_log {
            control_loop = control_loop.with_perf_log(perf_log);
        }

        Ok((control_loop, end_handle, DataLoop::new(payload_tx)))
    }

    fn spawn(
        flow_id: FlowId,
        lifecycle: Lifecycle,
        mut control_loop: FlowControlLoop,
        end_handle: Option<EndHandle>,
        mut data_loop: DataLoop<flow::PayloadTx>,
    ) -> Result<Self, Error> {
        let flag = lifecycle.flag();
        let notifier = lifecycle.notifier();

        let control_thread = thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                let result = control_loop.run(&flag);
                let _ = notifier.send(Event::ControlStopped);
                result
            })?;

        log::debug!("flow {flow_id}: started control thread");

        let flag = lifecycle.flag();
        let notifier = lifecycle.notifier();

        let data_thread = thread::Builder::new()
            .name("data".into())
            .spawn(move || {
                let exit = data_loop.run(&flag);
                let _ = notifier.send(Event::DataStopped);
                exit
            })?;

        log::info!("flow {flow_id}: sending data");

        Ok(Self {
            flow_id,
            lifecycle,
            end_handle,
            control_thread,
            data_thread,
        })
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Requests an orderly shutdown, as a termination signal would.
    pub fn shutdown(&self) {
        self.lifecycle.request_shutdown();
    }

    /// Blocks until both loops have returned or shutdown has been requested. After a termination
    /// the loops may still be blocked on I/O; the caller is expected to exit the process.
    pub fn wait(self) -> Outcome {
        let outcome = self.lifecycle.supervise(true, self.end_handle);

        match outcome {
            Outcome::Completed => {
                match self.control_thread.join() {
                    Ok(Ok(stats)) => log::info!("flow {}: control loop done: {stats:?}", self.flow_id),
                    Ok(Err(err)) => log::warn!("flow {}: control loop failed: {err}", self.flow_id),
                    Err(_) => log::warn!("flow {}: control thread panicked", self.flow_id),
                }
                if self.data_thread.join().is_err() {
                    log::warn!("flow {}: data thread panicked", self.flow_id);
                }
            }
            Outcome::Terminated { .. } => {
                log::info!("flow {}: caught signal, exiting", self.flow_id);
            }
        }

        // Give a thread that is already winding down a moment to finish
        thread::sleep(time::Duration::from_millis(1));

        outcome
    }
}
