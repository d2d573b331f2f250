use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use super::message::{serial, Body, FlowId, Message, MessageKind};

const SOCKET_POLLING_KEY: usize = 0;

const RECV_BUFFER_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no decision process is connected")]
    NotConnected,
    #[error("decision process closed the connection")]
    Closed,
    #[error("END already sent; no further messages are accepted")]
    EndSent,
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] serial::EncodeError),
}

struct Connection {
    // Blocking stream; reads are only issued once the poller reports readability
    stream: UnixStream,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Bytes received but not yet returned as a frame
    reader: serial::FrameReader,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

/// Length-prefixed message transport to the decision process.
///
/// A channel may be created without a connection, in which case sending is a no-op. This allows the
/// control loop to run in kernel-only mode.
pub struct ControlChannel {
    conn: Option<Connection>,
    // Shared with every EndHandle
    end_guard: EndGuard,
}

/// Cloned writer half of a control channel, used to deliver END from outside the control loop.
pub struct EndHandle {
    stream: Option<UnixStream>,
    end_guard: EndGuard,
    flow_id: FlowId,
}

// Serializes writes to the decision process across the channel and its END handles, and records
// whether END has been written. Nothing is written after END.
#[derive(Clone, Default)]
struct EndGuard {
    end_sent: Arc<Mutex<bool>>,
}

impl EndGuard {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panicking writer cannot leave the flag half-updated
        self.end_sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Writes END unless it has already been written. Returns whether this call wrote it.
fn write_end(
    stream: &mut UnixStream,
    guard: &EndGuard,
    flow_id: FlowId,
) -> Result<bool, ChannelError> {
    let mut end_sent = guard.lock();

    if *end_sent {
        return Ok(false);
    }

    let frame = serial::encode(&Message::new(flow_id, Body::End))?;
    stream.write_all(&frame)?;
    *end_sent = true;

    Ok(true)
}

impl Connection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&stream, polling::Event::readable(SOCKET_POLLING_KEY))?;
        }

        Ok(Self {
            stream,
            poller,
            poller_events: polling::Events::new(),
            reader: serial::FrameReader::new(),
            recv_buffer: vec![0; RECV_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    /// Blocks for up to `timeout` until the stream is readable, then reads whatever is available.
    /// Returns Ok(false) if nothing could be read in the allotted time, or if polling awoke
    /// spuriously.
    fn wait_and_read(&mut self, timeout: Option<time::Duration>) -> Result<bool, ChannelError> {
        // Oneshot interest must be re-armed prior to each wait() call
        self.poller
            .modify(&self.stream, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = match self.poller.wait(&mut self.poller_events, timeout) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if n == 0 {
            return Ok(false);
        }

        // The stream is readable - read in confidence
        match self.stream.read(&mut self.recv_buffer) {
            Ok(0) => Err(ChannelError::Closed),
            Ok(len) => {
                self.reader.push(&self.recv_buffer[..len]);
                Ok(true)
            }
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(false),
                _ => Err(err.into()),
            },
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.stream);
    }
}

impl ControlChannel {
    /// Connects to a decision process listening at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::from_stream(UnixStream::connect(path)?)
    }

    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        Ok(Self {
            conn: Some(Connection::new(stream)?),
            end_guard: EndGuard::default(),
        })
    }

    /// Returns a channel with no decision process behind it.
    pub fn disconnected() -> Self {
        Self {
            conn: None,
            end_guard: EndGuard::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Encodes `message` and writes the whole frame. Does nothing if no decision process is
    /// connected. Once END has gone out, a repeated END is dropped and any other message fails
    /// with [`ChannelError::EndSent`].
    pub fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if message.kind() == MessageKind::End {
            write_end(&mut conn.stream, &self.end_guard, message.flow_id)?;
            return Ok(());
        }

        let end_sent = self.end_guard.lock();

        if *end_sent {
            return Err(ChannelError::EndSent);
        }

        let frame = serial::encode(message)?;
        conn.stream.write_all(&frame)?;

        Ok(())
    }

    /// Sends END for `flow_id` unless an END has already gone out on this channel. Returns whether
    /// this call sent it.
    pub fn send_end(&mut self, flow_id: FlowId) -> Result<bool, ChannelError> {
        match self.conn.as_mut() {
            Some(conn) => write_end(&mut conn.stream, &self.end_guard, flow_id),
            None => Ok(false),
        }
    }

    /// Blocks until one complete payload has arrived and returns it, waiting at most `timeout` if
    /// one is given. Returns Ok(None) if the timeout elapsed first.
    pub fn receive(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> Result<Option<Box<[u8]>>, ChannelError> {
        let conn = self.conn.as_mut().ok_or(ChannelError::NotConnected)?;

        let deadline = timeout.map(|timeout| time::Instant::now() + timeout);

        loop {
            if let Some(payload) = conn.reader.next_frame() {
                return Ok(Some(payload));
            }

            let wait_timeout = match deadline {
                Some(deadline) => {
                    let now = time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            conn.wait_and_read(wait_timeout)?;
        }
    }

    /// Returns a handle able to send END independently of this channel. The handle shares this
    /// channel's END guard.
    pub fn end_handle(&self, flow_id: FlowId) -> io::Result<EndHandle> {
        let stream = match &self.conn {
            Some(conn) => Some(conn.stream.try_clone()?),
            None => None,
        };

        Ok(EndHandle {
            stream,
            end_guard: self.end_guard.clone(),
            flow_id,
        })
    }

    pub fn end_sent(&self) -> bool {
        *self.end_guard.lock()
    }
}

impl EndHandle {
    /// Best-effort END delivery. Returns Ok(true) if this call wrote the END message, Ok(false) if
    /// there is no connection or END was already sent.
    pub fn send_end(&mut self) -> Result<bool, ChannelError> {
        match self.stream.as_mut() {
            Some(stream) => write_end(stream, &self.end_guard, self.flow_id),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;

    fn read_frame(stream: &mut UnixStream) -> Box<[u8]> {
        let mut header = [0u8; serial::HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
        stream.read_exact(&mut payload).unwrap();
        payload.into_boxed_slice()
    }

    #[test]
    fn disconnected_send_is_noop() {
        let mut channel = ControlChannel::disconnected();

        assert!(!channel.is_connected());
        channel.send(&Message::new(FlowId(1), Body::Start)).unwrap();
        assert!(!channel.send_end(FlowId(1)).unwrap());

        assert!(matches!(
            channel.receive(Some(time::Duration::from_millis(1))),
            Err(ChannelError::NotConnected)
        ));
    }

    #[test]
    fn send_and_receive() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();

        channel.send(&Message::new(FlowId(4), Body::Start)).unwrap();

        let payload = read_frame(&mut remote);
        let message = serial::decode_message(&payload).unwrap();
        assert_eq!(message, Message::new(FlowId(4), Body::Start));

        remote
            .write_all(&serial::encode_action(&Action { cwnd: 12 }).unwrap())
            .unwrap();

        let reply = channel.receive(None).unwrap().unwrap();
        assert_eq!(serial::decode_action(&reply).unwrap().cwnd, 12);
    }

    #[test]
    fn receive_times_out_and_keeps_partial_frame() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();

        let frame = serial::encode_action(&Action { cwnd: 99 }).unwrap();
        let (head, tail) = frame.split_at(3);

        remote.write_all(head).unwrap();
        let result = channel.receive(Some(time::Duration::from_millis(20))).unwrap();
        assert!(result.is_none());

        remote.write_all(tail).unwrap();
        let reply = channel
            .receive(Some(time::Duration::from_millis(1000)))
            .unwrap()
            .unwrap();
        assert_eq!(serial::decode_action(&reply).unwrap().cwnd, 99);
    }

    #[test]
    fn malformed_payload_does_not_close_channel() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();

        remote.write_all(&serial::write_frame(b"garbage").unwrap()).unwrap();
        remote
            .write_all(&serial::encode_action(&Action { cwnd: 5 }).unwrap())
            .unwrap();

        let first = channel.receive(None).unwrap().unwrap();
        assert!(serial::decode_action(&first).is_err());

        let second = channel.receive(None).unwrap().unwrap();
        assert_eq!(serial::decode_action(&second).unwrap().cwnd, 5);
    }

    #[test]
    fn peer_close_is_reported() {
        let (local, remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();

        drop(remote);

        assert!(matches!(channel.receive(None), Err(ChannelError::Closed)));
    }

    #[test]
    fn end_is_sent_once_across_handles() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();
        let mut handle = channel.end_handle(FlowId(2)).unwrap();

        assert!(handle.send_end().unwrap());
        assert!(!channel.send_end(FlowId(2)).unwrap());
        assert!(!handle.send_end().unwrap());
        channel.send(&Message::new(FlowId(2), Body::End)).unwrap();
        assert!(channel.end_sent());

        assert!(matches!(
            channel.send(&Message::new(FlowId(2), Body::Start)),
            Err(ChannelError::EndSent)
        ));

        drop(channel);
        drop(handle);

        let payload = read_frame(&mut remote);
        assert_eq!(
            serial::decode_message(&payload).unwrap().kind(),
            MessageKind::End
        );

        // Nothing else follows
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
