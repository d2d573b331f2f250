/*

ccpilot drives the congestion window of a single bulk TCP flow from an external decision process.

# Flow

The client opens one TCP connection to a receiver, selects a kernel congestion control algorithm
for it, and writes filler data on it for as long as it runs. A second thread samples the
connection's transport statistics on a fixed cadence (20ms by default), asks the decision process
for a new congestion window, and installs the answer into the kernel.

Without a decision process the flow runs under the kernel algorithm alone. The cadence still
applies, so a performance log can be collected for baseline runs.

# Decision process protocol

The decision process listens on a Unix stream socket. Every message in either direction is a
frame:

  +--------+-----------------+
  | len:16 | payload (len B) |
  +--------+-----------------+

The length is big-endian and counts payload bytes only. Payloads are JSON objects.

Client to decision process:

  {"type": 0, "flow_id": N}                                    INIT
  {"type": 1, "flow_id": N}                                    START
  {"type": 2, "flow_id": N}                                    END
  {"type": 3, "flow_id": N, "state": {...}}                    ALIVE
  {"type": 4, "flow_id": N, "state": {...}, "observer": K, "step": S}  OBSERVE

Decision process to client:

  {"flow_id": N}   reply to START, assigning the flow identity
  {"cwnd": W}      reply to ALIVE, the window to install (in packets)

START is sent once before the flow connection is opened. Each control cycle sends one ALIVE and
waits (bounded) for exactly one reply. A reply that misses its cycle is still owed: no further
ALIVE is sent until it has arrived and been discarded. END is sent at most once and nothing
follows it, whether it comes from the control loop as it stops or from the lifecycle controller
when the control loop is stalled past the grace period.

# Shutdown

A termination signal clears a shared flag. Both loops poll it between iterations; the control loop
then sends END and closes the performance log. The process exits once the control loop has done so
or the grace period expires, whichever comes first.

# Performance log

One header line, then one tab-separated line per control cycle:

  min_rtt avg_urtt cnt srtt_us avg_thr thr_cnt pacing_rate loss_bytes packets_out retrans_out
  max_packets_out "CWND in Kernel" "CWND to Assign"

Every line is flushed as it is written.

*/

pub mod cadence;
pub mod channel;
pub mod client;
pub mod control;
pub mod data;
pub mod flow;
pub mod lifecycle;
pub mod message;
pub mod perf_log;
pub mod telemetry;
pub mod trace;

pub use message::{FlowId, Message, MessageKind};
pub use telemetry::{RequestKind, Snapshot, TelemetrySource, WindowActuator};

pub type Client = client::Client;
pub type ClientConfig = client::ClientConfig;
