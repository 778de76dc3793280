//! The heap task daemon.
//!
//! Background collections, trims and background compactions run on one
//! dedicated thread fed by a channel. The daemon holds only a weak
//! reference to the heap; it exits when the heap is dropped, shuts down or
//! closes the channel.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use super::Heap;

/// Work the daemon runs on behalf of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum HeapTask {
    /// A concurrent collection requested when the heap had completed
    /// `gc_count` collections.
    ConcurrentGc { force_full: bool, gc_count: u64 },
    Trim,
    HomogeneousCompact,
}

pub(super) struct TaskDaemon {
    sender: Option<Sender<HeapTask>>,
    handle: Option<JoinHandle<()>>,
}

impl TaskDaemon {
    /// Starts the daemon thread.
    pub(super) fn spawn(heap: Weak<Heap>) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("heap task daemon".into())
            .spawn(move || run(&heap, &receiver))?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queues `task`. Returns `false` once the daemon is gone.
    pub(super) fn post(&self, task: HeapTask) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok())
    }

    /// Closes the channel and waits for the thread, unless called from the
    /// daemon itself.
    pub(super) fn stop(&mut self) {
        self.sender = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            debug!("heap task daemon panicked");
        }
    }
}

impl Drop for TaskDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(heap: &Weak<Heap>, receiver: &Receiver<HeapTask>) {
    debug!("heap task daemon started");
    while let Ok(task) = receiver.recv() {
        let Some(heap) = heap.upgrade() else {
            break;
        };
        if heap.is_shutting_down() {
            break;
        }
        trace!(?task, "running heap task");
        match task {
            HeapTask::ConcurrentGc { force_full, gc_count } => {
                heap.run_concurrent_gc(force_full, gc_count);
            }
            HeapTask::Trim => {
                heap.trim();
            }
            HeapTask::HomogeneousCompact => {
                if let Err(err) = heap.perform_homogeneous_space_compact() {
                    debug!(%err, "background compaction skipped");
                }
            }
        }
    }
    debug!("heap task daemon exiting");
}
