use std::io::{self, Write};

use super::lifecycle::ShutdownFlag;

/// Size of the filler buffer written on each iteration (one stdio buffer).
pub const FILLER_SIZE: usize = 8192;

const FILLER_BYTE: u8 = b'a';

/// Why the data loop returned.
#[derive(Debug)]
pub enum ExitReason {
    /// The shutdown flag was cleared.
    Shutdown,
    /// The connection failed. Only this loop is affected.
    Failed(io::Error),
}

#[derive(Debug)]
pub struct DataLoopExit {
    pub bytes_sent: u64,
    pub reason: ExitReason,
}

/// Writes filler payload on the primary connection until shutdown or connection failure.
///
/// The writer should have a write timeout configured so that a connection stalled on flow control
/// still lets the loop observe the shutdown flag. Timeouts are not treated as failures.
pub struct DataLoop<W: Write> {
    writer: W,
    filler: Box<[u8]>,
}

impl<W: Write> DataLoop<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            filler: vec![FILLER_BYTE; FILLER_SIZE].into_boxed_slice(),
        }
    }

    pub fn run(&mut self, flag: &ShutdownFlag) -> DataLoopExit {
        let mut bytes_sent = 0u64;

        let reason = loop {
            if !flag.is_running() {
                break ExitReason::Shutdown;
            }

            match self.writer.write(&self.filler) {
                Ok(0) => {
                    break ExitReason::Failed(io::Error::from(io::ErrorKind::WriteZero));
                }
                Ok(len) => {
                    bytes_sent += len as u64;
                }
                Err(err) => match err.kind() {
                    // Backpressure; go around and check the flag again
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => (),
                    _ => break ExitReason::Failed(err),
                },
            }
        };

        match &reason {
            ExitReason::Shutdown => log::info!("data loop exits after {bytes_sent} bytes"),
            ExitReason::Failed(err) => {
                log::warn!("data loop exits after {bytes_sent} bytes: {err}")
            }
        }

        DataLoopExit { bytes_sent, reason }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
