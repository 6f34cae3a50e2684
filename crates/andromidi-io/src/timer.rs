//! Device-open confirmation timer: a single named thread running one-shot
//! delayed tasks in due order.

use andromidi_core::{Result, Scheduler, Task};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const IDLE_WAIT: Duration = Duration::from_millis(100);

enum TimerCommand {
    Schedule { due: Instant, task: Task },
    Shutdown,
}

struct Pending {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the heap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// [`Scheduler`] backed by a dedicated thread.
///
/// Dropping the timer stops the thread; tasks that have not fired yet are
/// dropped without running.
pub struct TimerThread {
    command_sender: Sender<TimerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn new() -> Result<Self> {
        let (command_sender, command_receiver) = bounded(1024);

        let handle = thread::Builder::new()
            .name("midi-device-open-timer".to_string())
            .spawn(move || Self::timer_thread(command_receiver))?;

        Ok(Self {
            command_sender,
            handle: Some(handle),
        })
    }

    fn timer_thread(command_receiver: Receiver<TimerCommand>) {
        let mut pending = BinaryHeap::new();
        let mut next_seq = 0u64;

        loop {
            let now = Instant::now();
            while pending.peek().is_some_and(|next: &Pending| next.due <= now) {
                if let Some(next) = pending.pop() {
                    Self::run(next.task);
                }
            }

            let wait = pending
                .peek()
                .map(|next| next.due.saturating_duration_since(now))
                .unwrap_or(IDLE_WAIT);

            match command_receiver.recv_timeout(wait) {
                Ok(TimerCommand::Schedule { due, task }) => {
                    pending.push(Pending {
                        due,
                        seq: next_seq,
                        task,
                    });
                    next_seq += 1;
                }
                Ok(TimerCommand::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("Device open timer stopped with {} pending tasks", pending.len());
    }

    fn run(task: Task) {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("Device open timer task panicked");
        }
    }
}

impl Scheduler for TimerThread {
    fn schedule(&self, delay: Duration, task: Task) {
        let due = Instant::now() + delay;
        if self
            .command_sender
            .send(TimerCommand::Schedule { due, task })
            .is_err()
        {
            warn!("Device open timer is not running, dropping task");
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        let _ = self.command_sender.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            // A task may own the last reference to the timer
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for TimerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerThread")
            .field("queued_commands", &self.command_sender.len())
            .finish()
    }
}
