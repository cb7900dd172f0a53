//! Executor threads draining the command queue.
//!
//! Each worker loops forever: take the oldest command, wait for its turn
//! within its connection, run it, deliver its answer. A failing command is
//! logged and the worker moves on.

use crate::commands::{answer_command, process_command, ServerContext};
use crate::protocol::Command;
use crate::queue::{CommandQueue, Ticket};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, trace, warn};

/// Fixed set of executor threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads consuming `queue`.
    pub fn spawn(workers: usize, queue: Arc<CommandQueue>, ctx: ServerContext) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let queue = Arc::clone(&queue);
            let ctx = ctx.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &ctx))?;

            handles.push(handle);
        }

        info!(workers, "Executor workers started");
        Ok(Self { handles })
    }

    /// Number of executor threads.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

fn worker_loop(worker_id: usize, queue: &CommandQueue, ctx: &ServerContext) {
    loop {
        let cmd = queue.get();
        trace!(worker = worker_id, command = %cmd, "Executing command");
        execute(cmd, ctx);
    }
}

/// Run one dequeued command and deliver its answer.
///
/// Commands of one connection run one at a time, in submission order; the
/// turn passes on only after the answer has been written.
pub fn execute(mut cmd: Command, ctx: &ServerContext) {
    let _turn = cmd.ticket.take().map(Ticket::wait_turn);

    if process_command(&mut cmd, ctx).is_err() {
        warn!(key = cmd.key, "Unable to process command from client");
    }

    let key = cmd.key;
    if let Err(e) = answer_command(cmd, &ctx.directory) {
        warn!(key, error = %e, "Unable to answer command from client");
    }
}
