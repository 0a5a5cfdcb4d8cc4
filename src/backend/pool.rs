//! Embedded CPU task pool. A single dispatcher thread preserves program
//! order of launches while each launch fans its index range out over a
//! work-stealing rayon pool in blocks of `cpu_block_size` elements.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};

use crate::log::jit_log;

struct TaskState {
    done: Mutex<bool>,
    signal: Condvar,
}

/// Handle to one launched CPU kernel. Thread states keep the handle of
/// their most recent launch; the dispatcher is FIFO, so waiting on the
/// newest task implies completion of all earlier ones.
#[derive(Clone)]
pub struct Task(Arc<TaskState>);

impl Task {
    /// Block until the task has run. Never call this while holding the
    /// global state lock.
    pub fn wait(&self) {
        let mut done = self.0.done.lock().unwrap();
        while !*done {
            done = self.0.signal.wait(done).unwrap();
        }
    }
}

type Job = Box<dyn FnOnce(&rayon::ThreadPool) + Send>;

pub struct CpuPool {
    sender: Option<Sender<(Job, Arc<TaskState>)>>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
}

impl CpuPool {
    pub fn new() -> CpuPool {
        let (sender, receiver) = channel::<(Job, Arc<TaskState>)>();
        let dispatcher = std::thread::Builder::new()
            .name("enoki-dispatch".into())
            .spawn(move || {
                let pool = rayon::ThreadPoolBuilder::new()
                    .thread_name(|i| format!("enoki-worker-{i}"))
                    .build()
                    .expect("failed to start worker pool");
                while let Ok((job, state)) = receiver.recv() {
                    job(&pool);
                    *state.done.lock().unwrap() = true;
                    state.signal.notify_all();
                }
            })
            .expect("failed to start dispatcher thread");
        jit_log!(Debug, "pool", "started CPU task pool");
        CpuPool { sender: Some(sender), dispatcher: Some(dispatcher) }
    }

    /// Enqueue one kernel execution. `run` receives the worker pool and is
    /// expected to split its index range into blocks itself.
    pub fn submit(&self, run: impl FnOnce(&rayon::ThreadPool) + Send + 'static) -> Task {
        let state = Arc::new(TaskState { done: Mutex::new(false), signal: Condvar::new() });
        let sender = self.sender.as_ref().expect("pool already shut down");
        sender
            .send((Box::new(run), state.clone()))
            .expect("dispatcher thread terminated unexpectedly");
        Task(state)
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        // Closing the channel drains remaining jobs, then the thread exits
        drop(self.sender.take());
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        jit_log!(Debug, "pool", "CPU task pool shut down");
    }
}

/// Block decomposition of `size` elements into work items.
pub fn block_range(size: u32, block_size: u32) -> impl Iterator<Item = (u32, u32)> {
    let block_size = block_size.max(1);
    let blocks = size.div_ceil(block_size);
    (0..blocks).map(move |b| {
        let start = b * block_size;
        (start, size.min(start + block_size))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cover_range() {
        let blocks: Vec<_> = block_range(40000, 16384).collect();
        assert_eq!(blocks, vec![(0, 16384), (16384, 32768), (32768, 40000)]);
        assert_eq!(block_range(1, 16384).collect::<Vec<_>>(), vec![(0, 1)]);
        assert_eq!(block_range(0, 16384).count(), 0);
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let pool = CpuPool::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            tasks.push(pool.submit(move |_| log.lock().unwrap().push(i)));
        }
        tasks.last().unwrap().wait();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }
}
