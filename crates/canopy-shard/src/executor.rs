//! Single-owner serialized execution.
//!
//! Each shard's state is owned by exactly one task draining an ordered
//! queue of closures. There are no locks around pipeline or session
//! state; correctness depends on everything being funneled through this
//! queue, including completion callbacks of asynchronous work.

use crate::pipeline::{CommitPipeline, PipelineHost};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work against the owned state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Submission handle for the serialized queue. Cheap to clone.
pub struct SerialExecutor<S> {
    sender: mpsc::UnboundedSender<Task<S>>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Create the handle and the queue it feeds. The queue must then be
    /// started with [`TaskQueue::run`] once the state exists.
    pub fn channel() -> (Self, TaskQueue<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, TaskQueue { receiver })
    }

    /// Enqueue a task. Returns false if the owner loop has stopped.
    pub fn submit(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.sender.send(Box::new(task)).is_ok()
    }
}

/// Receiving side of the serialized queue.
pub struct TaskQueue<S> {
    receiver: mpsc::UnboundedReceiver<Task<S>>,
}

impl<S: Send + 'static> TaskQueue<S> {
    /// Spawn the owner loop. It drains tasks in order until every
    /// [`SerialExecutor`] clone is dropped, then yields the state back.
    pub fn run(self, state: S) -> JoinHandle<S> {
        let mut receiver = self.receiver;
        let mut state = state;
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task(&mut state);
            }
            state
        })
    }
}

/// A [`PipelineHost`] that reaches the pipeline embedded inside a larger
/// owned state through a projection function.
pub struct MappedHost<S: 'static> {
    executor: SerialExecutor<S>,
    project: fn(&mut S) -> &mut CommitPipeline,
}

impl<S> MappedHost<S> {
    pub fn new(executor: SerialExecutor<S>, project: fn(&mut S) -> &mut CommitPipeline) -> Self {
        Self { executor, project }
    }
}

impl<S: Send + 'static> PipelineHost for MappedHost<S> {
    fn submit(&self, task: Box<dyn FnOnce(&mut CommitPipeline) + Send>) {
        let project = self.project;
        self.executor.submit(move |state| task(project(state)));
    }
}
