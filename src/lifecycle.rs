use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use super::channel::EndHandle;

/// How long to wait for the control loop to finish its own shutdown after a signal.
pub const GRACE_PERIOD_DEFAULT: time::Duration = time::Duration::from_millis(200);

// Allows in-flight writes to settle before the process goes away
const SETTLE_TIME: time::Duration = time::Duration::from_millis(1);

/// Process-wide "keep going" flag shared by both loops. Starts out true and is cleared at most once.
#[derive(Clone, Debug)]
pub struct ShutdownFlag {
    running: Arc<AtomicBool>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clears the flag. Returns true if this call was the one that cleared it.
    pub fn trigger(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }
}

/// Notifications delivered to the lifecycle controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A termination signal was received.
    Signal,
    /// The control loop has returned.
    ControlStopped,
    /// The data loop has returned.
    DataStopped,
}

/// How supervision ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Both loops returned on their own.
    Completed,
    /// A termination signal (or explicit shutdown request) ended the run.
    Terminated {
        /// Whether the control loop finished within the grace period.
        control_stopped: bool,
        /// Whether the lifecycle controller had to deliver END itself.
        end_sent: bool,
    },
}

/// Owns the shutdown flag and turns external signals into an orderly shutdown.
///
/// Signal handlers only clear the flag and post an [`Event::Signal`]; the END handshake is carried
/// out by whichever thread calls [`Lifecycle::supervise`].
pub struct Lifecycle {
    flag: ShutdownFlag,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    grace_period: time::Duration,
}

impl Lifecycle {
    pub fn new(grace_period: time::Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel();

        Self {
            flag: ShutdownFlag::new(),
            events_tx,
            events_rx,
            grace_period,
        }
    }

    pub fn flag(&self) -> ShutdownFlag {
        self.flag.clone()
    }

    /// Returns a sender which loop threads use to report that they have returned.
    pub fn notifier(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    /// Installs handlers for SIGINT, SIGTERM and SIGHUP. May only be called once per process.
    pub fn install_signal_handlers(&self) -> Result<(), ctrlc::Error> {
        let flag = self.flag.clone();
        let events_tx = self.events_tx.clone();

        ctrlc::set_handler(move || {
            flag.trigger();
            let _ = events_tx.send(Event::Signal);
        })
    }

    /// Requests shutdown from within the process, as if a signal had arrived.
    pub fn request_shutdown(&self) {
        self.flag.trigger();
        let _ = self.events_tx.send(Event::Signal);
    }

    /// Blocks until both loops have returned, or until shutdown is requested. In the latter case
    /// the control loop is given the grace period to stop (and send END itself); failing that, END
    /// is delivered through `end` on a best-effort basis.
    pub fn supervise(&self, control_running: bool, end: Option<EndHandle>) -> Outcome {
        let mut control_running = control_running;
        let mut data_running = true;

        loop {
            match self.events_rx.recv() {
                Ok(Event::Signal) => {
                    return self.terminate(control_running, end);
                }
                Ok(Event::ControlStopped) => {
                    log::debug!("control loop returned");
                    control_running = false;
                }
                Ok(Event::DataStopped) => {
                    log::debug!("data loop returned");
                    data_running = false;
                }
                Err(_) => {
                    // Every sender is gone; nothing further can happen
                    return Outcome::Completed;
                }
            }

            if !control_running && !data_running {
                return Outcome::Completed;
            }
        }
    }

    fn terminate(&self, control_running: bool, end: Option<EndHandle>) -> Outcome {
        self.flag.trigger();

        let mut control_stopped = !control_running;

        if control_running {
            let deadline = time::Instant::now() + self.grace_period;

            while !control_stopped {
                let now = time::Instant::now();
                if now >= deadline {
                    break;
                }

                match self.events_rx.recv_timeout(deadline - now) {
                    Ok(Event::ControlStopped) => control_stopped = true,
                    Ok(_) => (),
                    Err(_) => break,
                }
            }

            if !control_stopped {
                log::warn!(
                    "control loop did not stop within {}ms",
                    self.grace_period.as_millis()
                );
            }
        }

        let mut end_sent = false;

        if let Some(mut end) = end {
            match end.send_end() {
                Ok(sent) => end_sent = sent,
                Err(err) => log::warn!("failed to send END: {err}"),
            }
        }

        thread::sleep(SETTLE_TIME);

        Outcome::Terminated {
            control_stopped,
            end_sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ControlChannel;
    use crate::message::{serial, FlowId, MessageKind};
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn count_end_messages(mut remote: UnixStream) -> usize {
        let mut bytes = Vec::new();
        remote.read_to_end(&mut bytes).unwrap();

        let mut reader = serial::FrameReader::new();
        reader.push(&bytes);

        let mut count = 0;
        while let Some(payload) = reader.next_frame() {
            if serial::decode_message(&payload).unwrap().kind() == MessageKind::End {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn flag_triggers_once() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();

        assert!(flag.is_running());
        assert!(other.trigger());
        assert!(!flag.is_running());
        assert!(!flag.trigger());
        assert!(!other.is_running());
    }

    #[test]
    fn completes_when_both_loops_return() {
        let lifecycle = Lifecycle::new(GRACE_PERIOD_DEFAULT);
        let notifier = lifecycle.notifier();

        notifier.send(Event::DataStopped).unwrap();
        notifier.send(Event::ControlStopped).unwrap();

        assert_eq!(lifecycle.supervise(true, None), Outcome::Completed);
        assert!(lifecycle.flag().is_running());
    }

    #[test]
    fn data_loop_exit_does_not_stop_control() {
        let lifecycle = Lifecycle::new(GRACE_PERIOD_DEFAULT);
        let notifier = lifecycle.notifier();
        let flag = lifecycle.flag();

        notifier.send(Event::DataStopped).unwrap();
        lifecycle.request_shutdown();

        let outcome = lifecycle.supervise(false, None);

        assert_eq!(
            outcome,
            Outcome::Terminated {
                control_stopped: true,
                end_sent: false
            }
        );
        assert!(!flag.is_running());
    }

    #[test]
    fn control_loop_sends_end_within_grace() {
        let (local, remote) = UnixStream::pair().unwrap();
        let mut channel = ControlChannel::from_stream(local).unwrap();
        let end = channel.end_handle(FlowId(1)).unwrap();

        let lifecycle = Lifecycle::new(time::Duration::from_secs(2));
        let flag = lifecycle.flag();
        let notifier = lifecycle.notifier();

        // Stand-in for the control loop: stop on the flag, send END, report back
        let control = thread::spawn(move || {
            while flag.is_running() {
                thread::sleep(time::Duration::from_millis(1));
            }
            channel.send_end(FlowId(1)).unwrap();
            notifier.send(Event::ControlStopped).unwrap();
        });

        lifecycle.request_shutdown();
        let outcome = lifecycle.supervise(true, Some(end));
        control.join().unwrap();

        assert_eq!(
            outcome,
            Outcome::Terminated {
                control_stopped: true,
                end_sent: false
            }
        );

        drop(lifecycle);
        assert_eq!(count_end_messages(remote), 1);
    }

    #[test]
    fn stalled_control_loop_gets_end_from_lifecycle() {
        let (local, remote) = UnixStream::pair().unwrap();
        let channel = ControlChannel::from_stream(local).unwrap();
        let end = channel.end_handle(FlowId(8)).unwrap();

        let lifecycle = Lifecycle::new(time::Duration::from_millis(20));

        lifecycle.request_shutdown();
        let outcome = lifecycle.supervise(true, Some(end));

        assert_eq!(
            outcome,
            Outcome::Terminated {
                control_stopped: false,
                end_sent: true
            }
        );

        // A second END attempt through the channel is suppressed
        let mut channel = channel;
        assert!(!channel.send_end(FlowId(8)).unwrap());
        drop(channel);

        assert_eq!(count_end_messages(remote), 1);
    }
}
