//! Bounded handoff between connection handlers and executor workers.
//!
//! `CommandQueue` is a classic producer/consumer ring: one semaphore counts
//! free slots, one counts resident commands, and a mutex guards the ring
//! itself. Service is first-in-first-out across all producers.
//!
//! A FIFO queue orders dequeues, not executions: two workers may pick up two
//! commands of one connection back to back. `Sequencer` restores per-connection
//! execution order by handing out numbered tickets.

use crate::protocol::Command;
use crate::semaphore::Semaphore;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Fixed-capacity FIFO of commands shared by all handlers and workers.
pub struct CommandQueue {
    produceable: Semaphore,
    consumeable: Semaphore,
    ring: Mutex<VecDeque<Command>>,
    capacity: usize,
}

impl CommandQueue {
    /// Create a queue holding at most `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            produceable: Semaphore::new(capacity),
            consumeable: Semaphore::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueue `cmd`, blocking while the queue is full.
    pub fn put(&self, cmd: Command) {
        self.produceable.acquire();
        {
            let mut ring = self.ring.lock();
            trace!(
                key = cmd.key,
                kind = %cmd.kind,
                resident = ring.len() + 1,
                capacity = self.capacity,
                "Pushing command"
            );
            ring.push_back(cmd);
        }
        self.consumeable.release();
    }

    /// Dequeue the oldest command, blocking while the queue is empty.
    pub fn get(&self) -> Command {
        self.consumeable.acquire();
        let cmd = {
            let mut ring = self.ring.lock();
            // A consumeable unit is only released after a push.
            let cmd = ring
                .pop_front()
                .expect("consumeable permit without a resident command");
            trace!(key = cmd.key, kind = %cmd.kind, resident = ring.len(), "Fetched command");
            cmd
        };
        self.produceable.release();
        cmd
    }

    /// Commands currently resident.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Check if no command is resident.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Maximum number of resident commands.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Per-connection turn counter.
#[derive(Default)]
pub struct Sequencer {
    next_issue: Mutex<u64>,
    now_serving: Mutex<u64>,
    turn: Condvar,
}

impl Sequencer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand out the next ticket, in submission order.
    pub fn issue(self: &Arc<Self>) -> Ticket {
        let mut next = self.next_issue.lock();
        let seq = *next;
        *next += 1;
        Ticket {
            sequencer: Arc::clone(self),
            seq,
        }
    }
}

/// Right to execute once every earlier command of the same connection has.
pub struct Ticket {
    sequencer: Arc<Sequencer>,
    seq: u64,
}

impl Ticket {
    /// Block until this ticket is being served.
    ///
    /// The turn passes to the next ticket when the returned guard drops.
    pub fn wait_turn(self) -> Turn {
        {
            let mut serving = self.sequencer.now_serving.lock();
            while *serving != self.seq {
                self.sequencer.turn.wait(&mut serving);
            }
        }
        Turn { ticket: self }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").field("seq", &self.seq).finish()
    }
}

/// Held while a command executes.
pub struct Turn {
    ticket: Ticket,
}

impl Drop for Turn {
    fn drop(&mut self) {
        let sequencer = &self.ticket.sequencer;
        let mut serving = sequencer.now_serving.lock();
        *serving = self.ticket.seq + 1;
        sequencer.turn.notify_all();
    }
}
