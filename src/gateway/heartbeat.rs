//! Heartbeat controller.
//!
//! The controller runs as its own task and owns [`HeartbeatState`]. The
//! receive loop talks to it only through [`HeartbeatController`] messages
//! (ack observed, immediate beat requested, stop) and reads published
//! snapshots, so zombie detection never races with ack handling.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatPhase {
    Idle,
    Running,
    Stopped,
}

/// Snapshot of the heartbeat loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatState {
    pub phase: HeartbeatPhase,
    pub interval: Duration,
    pub last_sent_at: Option<Instant>,
    pub last_ack_at: Option<Instant>,
    /// A heartbeat was sent and its ack has not been observed yet.
    pub outstanding: bool,
    /// Round trip of the most recently acknowledged heartbeat.
    pub latency: Option<Duration>,
    pub beats_sent: u64,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::idle(Duration::ZERO)
    }
}

impl HeartbeatState {
    fn idle(interval: Duration) -> Self {
        Self {
            phase: HeartbeatPhase::Idle,
            interval,
            last_sent_at: None,
            last_ack_at: None,
            outstanding: false,
            latency: None,
            beats_sent: 0,
        }
    }
}

/// Why the heartbeat loop ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatExit {
    /// `stop()` was called or the controller was dropped.
    Stopped,
    /// The previous heartbeat was never acknowledged.
    Zombied,
    /// The send function reported the connection is gone.
    SendFailed,
}

#[derive(Debug)]
enum Command {
    Ack,
    BeatNow,
    Stop,
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<HeartbeatState>,
    task: JoinHandle<HeartbeatExit>,
    exit: Option<HeartbeatExit>,
}

impl HeartbeatController {
    /// Spawns the heartbeat loop.
    ///
    /// Every `interval` the loop calls `send`, which must queue one heartbeat
    /// carrying the current sequence and return `false` once the connection
    /// can no longer accept frames.
    pub fn start<F>(interval: Duration, send: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(HeartbeatState::idle(interval));
        let task = tokio::spawn(run_heartbeat(interval, send, command_rx, state_tx));

        Self {
            commands,
            state,
            task,
            exit: None,
        }
    }

    /// Reports that the server acknowledged the last heartbeat.
    pub fn ack(&self) {
        let _ = self.commands.send(Command::Ack);
    }

    /// Cuts the current sleep short and beats now, unless a heartbeat is
    /// still waiting for its ack.
    pub fn request_immediate(&self) {
        let _ = self.commands.send(Command::BeatNow);
    }

    /// Stops the loop. Safe to call any number of times.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn state(&self) -> HeartbeatState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state.clone()
    }

    /// Waits for the loop to end and reports why.
    pub async fn finished(&mut self) -> HeartbeatExit {
        if let Some(exit) = self.exit {
            return exit;
        }
        let exit = (&mut self.task).await.unwrap_or(HeartbeatExit::Stopped);
        self.exit = Some(exit);
        exit
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_heartbeat<F>(
    interval: Duration,
    mut send: F,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<HeartbeatState>,
) -> HeartbeatExit
where
    F: FnMut() -> bool + Send + 'static,
{
    let mut state = HeartbeatState {
        phase: HeartbeatPhase::Running,
        ..HeartbeatState::idle(interval)
    };
    state_tx.send_replace(state.clone());
    let mut next_beat = Instant::now() + interval;

    let exit = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                None | Some(Command::Stop) => break HeartbeatExit::Stopped,
                Some(Command::Ack) => {
                    let now = Instant::now();
                    if state.outstanding {
                        state.latency = state.last_sent_at.map(|sent| now - sent);
                    }
                    state.outstanding = false;
                    state.last_ack_at = Some(now);
                    debug!(
                        event = "heartbeat_ack",
                        latency_ms = state.latency.map(|latency| latency.as_millis() as u64),
                    );
                    state_tx.send_replace(state.clone());
                }
                Some(Command::BeatNow) => {
                    if state.outstanding {
                        debug!(event = "heartbeat_request_ignored", reason = "ack_outstanding");
                        continue;
                    }
                    if !beat(&mut send, &mut state, &state_tx) {
                        break HeartbeatExit::SendFailed;
                    }
                    next_beat = Instant::now() + interval;
                }
            },
            () = tokio::time::sleep_until(next_beat) => {
                if state.outstanding {
                    warn!(
                        event = "heartbeat_zombied",
                        interval_ms = interval.as_millis() as u64,
                        beats_sent = state.beats_sent,
                    );
                    break HeartbeatExit::Zombied;
                }
                if !beat(&mut send, &mut state, &state_tx) {
                    break HeartbeatExit::SendFailed;
                }
                next_beat += interval;
            }
        }
    };

    state.phase = HeartbeatPhase::Stopped;
    state_tx.send_replace(state);
    exit
}

fn beat<F>(send: &mut F, state: &mut HeartbeatState, state_tx: &watch::Sender<HeartbeatState>) -> bool
where
    F: FnMut() -> bool,
{
    if !send() {
        return false;
    }
    state.outstanding = true;
    state.last_sent_at = Some(Instant::now());
    state.beats_sent += 1;
    state_tx.send_replace(state.clone());
    true
}
