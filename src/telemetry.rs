use serde::{Deserialize, Serialize};

/// Point-in-time transport state of one flow.
///
/// Field names on the wire follow the decision process protocol, which is why several of them are
/// renamed. RTT-family values are in microseconds, except `srtt_us`, which carries the kernel's
/// fixed-point representation (1/8 microsecond ticks).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Minimum observed RTT, in microseconds.
    pub min_rtt: u32,
    /// Average of the RTT samples taken since the previous snapshot, in microseconds.
    #[serde(rename = "avg_urtt")]
    pub avg_micro_rtt: u32,
    /// Number of RTT samples behind `avg_micro_rtt`.
    #[serde(rename = "cnt")]
    pub sample_count: u32,
    /// Smoothed RTT, kernel fixed-point (`>> 3` for microseconds).
    pub srtt_us: u32,
    /// Average delivery rate, in bytes per second.
    #[serde(rename = "avg_thr")]
    pub avg_throughput: u64,
    /// Number of samples behind `avg_throughput`.
    #[serde(rename = "thr_cnt")]
    pub throughput_count: u32,
    /// Current pacing rate, in bytes per second.
    pub pacing_rate: u64,
    /// Cumulative lost bytes.
    pub loss_bytes: u64,
    /// Packets currently in flight.
    pub packets_out: u32,
    /// Packets currently retransmitted and unacknowledged.
    pub retrans_out: u32,
    /// Maximum `packets_out` observed so far.
    pub max_packets_out: u32,
    /// Congestion window currently in effect, in packets.
    pub cwnd: u32,
}

impl Snapshot {
    /// Smoothed RTT converted out of the kernel fixed-point into microseconds.
    pub fn srtt_micros(&self) -> u32 {
        self.srtt_us >> 3
    }
}

/// Distinguishes the reasons a snapshot may be requested from the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Snapshot feeding a window decision.
    Action,
    /// Snapshot taken for observation only.
    Observe,
}

/// Source of transport telemetry for one flow.
pub trait TelemetrySource {
    fn read_snapshot(&mut self, kind: RequestKind) -> std::io::Result<Snapshot>;
}

/// Sink for congestion window decisions.
pub trait WindowActuator {
    // Sets the congestion window, in packets.
    fn set_window(&mut self, cwnd: u32) -> std::io::Result<()>;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Box<T> {
    fn read_snapshot(&mut self, kind: RequestKind) -> std::io::Result<Snapshot> {
        (**self).read_snapshot(kind)
    }
}

impl<T: WindowActuator + ?Sized> WindowActuator for Box<T> {
    fn set_window(&mut self, cwnd: u32) -> std::io::Result<()> {
        (**self).set_window(cwnd)
    }
}
