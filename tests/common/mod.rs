#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time;

use ccpilot::channel::ControlChannel;
use ccpilot::lifecycle::ShutdownFlag;
use ccpilot::message::{serial, Body, Message, MessageKind};
use ccpilot::{RequestKind, Snapshot, TelemetrySource, WindowActuator};

/// Produces the raw reply payload (unframed) for a message, if any.
pub type Responder = Box<dyn FnMut(&Message) -> Option<Vec<u8>> + Send>;

/// A decision process stand-in listening on a Unix socket in a temporary directory. Serves a
/// single connection until END or disconnect and hands back everything it received.
pub struct FakeDecisionProcess {
    _dir: tempfile::TempDir,
    path: PathBuf,
    thread: thread::JoinHandle<Vec<Message>>,
}

impl FakeDecisionProcess {
    pub fn spawn(mut responder: Responder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decision.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let thread = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve(&mut stream, &mut responder)
        });

        Self {
            _dir: dir,
            path,
            thread,
        }
    }

    /// Assigns `flow_id` on START and replies to every ALIVE with the next value from `reply`.
    pub fn with_actions<F>(flow_id: u32, mut reply: F) -> Self
    where
        F: FnMut(usize) -> Vec<u8> + Send + 'static,
    {
        let mut alive_count = 0;

        Self::spawn(Box::new(move |message| match message.body {
            Body::Start => Some(format!(r#"{{"flow_id": {flow_id}}}"#).into_bytes()),
            Body::Alive { .. } => {
                alive_count += 1;
                Some(reply(alive_count))
            }
            _ => None,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> ControlChannel {
        ControlChannel::connect(&self.path).unwrap()
    }

    pub fn join(self) -> Vec<Message> {
        self.thread.join().unwrap()
    }
}

fn serve(stream: &mut UnixStream, responder: &mut Responder) -> Vec<Message> {
    let mut reader = serial::FrameReader::new();
    let mut buffer = [0u8; 4096];
    let mut received = Vec::new();

    loop {
        while let Some(payload) = reader.next_frame() {
            let message = serial::decode_message(&payload).unwrap();
            let is_end = message.kind() == MessageKind::End;

            if let Some(reply) = responder(&message) {
                // The client may already be gone
                let _ = stream.write_all(&serial::write_frame(&reply).unwrap());
            }

            received.push(message);

            if is_end {
                return received;
            }
        }

        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => return received,
            Ok(len) => reader.push(&buffer[..len]),
        }
    }
}

pub fn count_kind(messages: &[Message], kind: MessageKind) -> usize {
    messages.iter().filter(|m| m.kind() == kind).count()
}

pub fn action(cwnd: u32) -> Vec<u8> {
    format!(r#"{{"cwnd": {cwnd}}}"#).into_bytes()
}

/// Reports a fixed kernel window, logs when it was read, and clears the flag after a given number
/// of reads so that the loop stops after exactly that many cycles.
pub struct ScriptedSource {
    pub kernel_cwnd: u32,
    pub flag: ShutdownFlag,
    pub stop_after: usize,
    pub reads: Arc<Mutex<Vec<time::Instant>>>,
}

impl ScriptedSource {
    pub fn new(kernel_cwnd: u32, flag: ShutdownFlag, stop_after: usize) -> Self {
        Self {
            kernel_cwnd,
            flag,
            stop_after,
            reads: Default::default(),
        }
    }
}

impl TelemetrySource for ScriptedSource {
    fn read_snapshot(&mut self, _kind: RequestKind) -> io::Result<Snapshot> {
        let mut reads = self.reads.lock().unwrap();
        reads.push(time::Instant::now());

        if reads.len() >= self.stop_after {
            self.flag.trigger();
        }

        Ok(Snapshot {
            min_rtt: 1_000,
            srtt_us: 8 * 1_200,
            packets_out: self.kernel_cwnd / 2,
            max_packets_out: self.kernel_cwnd,
            cwnd: self.kernel_cwnd,
            ..Default::default()
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingActuator {
    pub windows: Arc<Mutex<Vec<u32>>>,
}

impl WindowActuator for RecordingActuator {
    fn set_window(&mut self, cwnd: u32) -> io::Result<()> {
        self.windows.lock().unwrap().push(cwnd);
        Ok(())
    }
}

