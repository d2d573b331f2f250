//! The primary TCP connection and its kernel control surface.
//!
//! A connected flow is split into handles with disjoint responsibilities: [`PayloadTx`] only
//! writes application bytes, [`FlowControl`] only reads telemetry, and the [`FlowWindow`] it hands
//! out only writes the congestion window. All of them refer to the same socket, but none touches
//! state another depends on, so the loops driving them need no lock between them.

use std::io::{self, Write};
use std::mem;
use std::net;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time;

use super::telemetry::{RequestKind, Snapshot, TelemetrySource, WindowActuator};

// Option numbers below follow the patched kernel's uapi tcp.h; stock kernels reject both.

/// Socket option (patched kernel) which hands window control to user space.
pub const TCP_EXTERNAL_CONTROL: libc::c_int = 44;

/// Socket option (patched kernel) which sets the congestion window, in packets.
pub const TCP_EXTERNAL_CWND: libc::c_int = 47;

// Value written to TCP_EXTERNAL_CONTROL: window writes from user space take effect immediately
const EXTERNAL_CONTROL_MODE: libc::c_int = 2;

// Bound on a single blocked payload write, so the data loop can poll the shutdown flag
const PAYLOAD_WRITE_TIMEOUT: time::Duration = time::Duration::from_millis(100);

// TCP_CA_NAME_MAX
const CONGESTION_NAME_MAX: usize = 16;

/// Mirror of the kernel's `struct tcp_info`. Older kernels fill a prefix of it; the rest stays
/// zeroed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub wscale: u8,
    pub flags: u8,

    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,

    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,

    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,

    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,

    pub rcv_rtt: u32,
    pub rcv_space: u32,

    pub total_retrans: u32,

    pub pacing_rate: u64,
    pub max_pacing_rate: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub segs_out: u32,
    pub segs_in: u32,

    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,

    pub delivery_rate: u64,

    pub busy_time: u64,
    pub rwnd_limited: u64,
    pub sndbuf_limited: u64,

    pub delivered: u32,
    pub delivered_ce: u32,

    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub dsack_dups: u32,
    pub reord_seen: u32,
}

/// Payload-writing half of a flow.
pub struct PayloadTx {
    stream: Arc<net::TcpStream>,
}

/// Telemetry half of a flow. Window writes go through the [`FlowWindow`] it hands out.
pub struct FlowControl {
    stream: Arc<net::TcpStream>,
    // Running state needed to derive per-snapshot values
    max_packets_out: u32,
    last_delivered: Option<u32>,
}

/// Window actuation handle for a flow.
pub struct FlowWindow {
    stream: Arc<net::TcpStream>,
}

impl Write for PayloadTx {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.stream).flush()
    }
}

impl PayloadTx {
    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        self.stream.local_addr()
    }
}

fn setsockopt_raw(
    fd: libc::c_int,
    name: libc::c_int,
    value: *const libc::c_void,
    len: usize,
) -> io::Result<()> {
    // SAFETY:
    // - fd is a live socket owned by the caller for the duration of the call
    // - value points to len readable bytes
    let result =
        unsafe { libc::setsockopt(fd, libc::IPPROTO_TCP, name, value, len as libc::socklen_t) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_int_option(stream: &net::TcpStream, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    setsockopt_raw(
        stream.as_raw_fd(),
        name,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>(),
    )
}

/// Selects the kernel congestion control algorithm for `stream`.
pub fn set_congestion_control(stream: &net::TcpStream, algorithm: &str) -> io::Result<()> {
    if algorithm.is_empty() || algorithm.len() >= CONGESTION_NAME_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid congestion control name {algorithm:?}"),
        ));
    }

    setsockopt_raw(
        stream.as_raw_fd(),
        libc::TCP_CONGESTION,
        algorithm.as_ptr() as *const libc::c_void,
        algorithm.len(),
    )
}

/// Returns the name of the congestion control algorithm in effect for `stream`.
pub fn congestion_control(stream: &net::TcpStream) -> io::Result<String> {
    let mut name = [0u8; CONGESTION_NAME_MAX];
    let mut len = name.len() as libc::socklen_t;

    // SAFETY: getsockopt writes at most len bytes into name, which has that capacity
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            name.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let len = (len as usize).min(name.len());
    let end = name[..len].iter().position(|&b| b == 0).unwrap_or(len);

    Ok(String::from_utf8_lossy(&name[..end]).into_owned())
}

/// Reads `TCP_INFO` for `stream`.
pub fn tcp_info(stream: &net::TcpStream) -> io::Result<TcpInfo> {
    let mut info = TcpInfo::default();
    let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

    // SAFETY: getsockopt writes at most len bytes into info, a plain-old-data struct of that size
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut TcpInfo as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 {
        Ok(info)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Connects to `addr`, selects `algorithm`, and splits the connection into its two halves.
pub fn connect(addr: net::SocketAddr, algorithm: &str) -> io::Result<(PayloadTx, FlowControl)> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.connect(&addr.into())?;

    let stream: net::TcpStream = socket.into();

    set_congestion_control(&stream, algorithm)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(PAYLOAD_WRITE_TIMEOUT))?;

    Ok(split(stream))
}

/// Splits an already connected stream into its two halves.
pub fn split(stream: net::TcpStream) -> (PayloadTx, FlowControl) {
    let stream_rc = Arc::new(stream);

    let tx = PayloadTx {
        stream: Arc::clone(&stream_rc),
    };

    let control = FlowControl {
        stream: stream_rc,
        max_packets_out: 0,
        last_delivered: None,
    };

    (tx, control)
}

impl FlowControl {
    /// Hands window control to user space. Must be called after the connection is established.
    pub fn enable_external_control(&self) -> io::Result<()> {
        set_int_option(&self.stream, TCP_EXTERNAL_CONTROL, EXTERNAL_CONTROL_MODE)
    }

    pub fn congestion_control(&self) -> io::Result<String> {
        congestion_control(&self.stream)
    }

    pub fn window(&self) -> FlowWindow {
        FlowWindow {
            stream: Arc::clone(&self.stream),
        }
    }

    pub fn peer_addr(&self) -> io::Result<net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// Converts raw kernel counters into a snapshot, updating the running maximum and delivery
    /// counters.
    pub fn snapshot_from_info(&mut self, info: &TcpInfo) -> Snapshot {
        self.max_packets_out = self.max_packets_out.max(info.unacked);

        let sample_count = match self.last_delivered {
            Some(last) => info.delivered.wrapping_sub(last),
            None => info.delivered,
        };
        self.last_delivered = Some(info.delivered);

        Snapshot {
            min_rtt: info.min_rtt,
            avg_micro_rtt: info.rtt,
            sample_count,
            // Kernel fixed-point, as the decision process expects
            srtt_us: info.rtt.saturating_mul(8),
            avg_throughput: info.delivery_rate,
            throughput_count: u32::from(info.delivery_rate > 0),
            pacing_rate: info.pacing_rate,
            loss_bytes: cumulative_loss_bytes(info),
            packets_out: info.unacked,
            retrans_out: info.retrans,
            max_packets_out: self.max_packets_out,
            cwnd: info.snd_cwnd,
        }
    }
}

// tcpi_lost only counts packets currently marked lost, so it can shrink. Retransmitted bytes are
// cumulative; kernels older than 4.19 leave bytes_retrans zeroed, so estimate it from the
// retransmission count there.
fn cumulative_loss_bytes(info: &TcpInfo) -> u64 {
    if info.bytes_retrans > 0 {
        info.bytes_retrans
    } else {
        u64::from(info.total_retrans) * u64::from(info.snd_mss)
    }
}

impl TelemetrySource for FlowControl {
    fn read_snapshot(&mut self, kind: RequestKind) -> io::Result<Snapshot> {
        let info = tcp_info(&self.stream)?;
        let snapshot = self.snapshot_from_info(&info);

        log::trace!("{kind:?} snapshot: {snapshot:?}");

        Ok(snapshot)
    }
}

impl WindowActuator for FlowWindow {
    fn set_window(&mut self, cwnd: u32) -> io::Result<()> {
        let value = libc::c_int::try_from(cwnd)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "window out of range"))?;

        set_int_option(&self.stream, TCP_EXTERNAL_CWND, value)
    }
}
