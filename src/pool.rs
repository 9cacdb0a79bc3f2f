//! Worker pool driving connection state machines
//!
//! Workers take work from the bounded queue and execute one state-machine
//! step per task. They never own a connection across a blocking wait: a
//! step runs to its re-arm point and the connection goes back to the
//! reactor. Shutdown is three-phase: close the queue (non-blocking), join
//! the workers (blocking), drop the storage.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::connection::{notify_completion, step, Conn, StepContext};
use crate::queue::{Message, TaskQueue};

/// A fixed set of worker threads in a dequeue-and-dispatch loop.
#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<TaskQueue<Conn>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads consuming from `queue`.
    pub fn spawn(
        workers: usize,
        queue: Arc<TaskQueue<Conn>>,
        ctx: Arc<StepContext>,
    ) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, &queue, &ctx))?;
            handles.push(handle);
        }

        Ok(Self { queue, handles })
    }

    /// Phase one: close the queue and wake every worker. Non-blocking;
    /// already-queued work still drains first.
    pub fn shutdown(&self) {
        self.queue.shutdown(self.handles.len());
    }

    /// Phase two: wait for every worker to exit. Call after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread died outside of a task");
            }
        }
    }
}

fn worker_loop(id: usize, queue: &TaskQueue<Conn>, ctx: &StepContext) {
    loop {
        match queue.dequeue() {
            Message::Shutdown => {
                debug!("worker-{id} exiting");
                return;
            }
            Message::Work(conn) => {
                // A panicking step must not take the worker down with it.
                // The connection is unrecoverable though: destroy it so the
                // client is not left waiting on a wedged record.
                if panic::catch_unwind(AssertUnwindSafe(|| step(&conn, ctx))).is_err() {
                    error!("worker-{id}: connection step panicked");
                    let token = {
                        let mut record = conn.lock().unwrap_or_else(|p| p.into_inner());
                        record.destroy();
                        record.token()
                    };
                    notify_completion(token, ctx);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::WorkerPool;
    use crate::connection::StepContext;
    use crate::queue::TaskQueue;

    #[test]
    fn pool_spawns_and_joins_through_the_poison_protocol() {
        let ctx = Arc::new(StepContext::stub());
        let queue = Arc::new(TaskQueue::bounded(8));
        let pool = WorkerPool::spawn(4, Arc::clone(&queue), ctx).unwrap();

        pool.shutdown();
        // A second shutdown must not add extra poisons.
        pool.shutdown();
        pool.join();

        assert!(queue.is_empty());
    }
}
