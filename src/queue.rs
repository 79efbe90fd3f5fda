//! Ordered outbound task queue.
//!
//! Submissions are appended and return immediately. A single consumer loop
//! drains them in FIFO order with at most one backend call in flight.
//! Cancellation never interrupts that call: it bumps an epoch, and when the
//! call returns the loop sees the stale epoch and drops the result.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::backend::{CallHandle, api};
use crate::error::{CallError, SubmitError};
use crate::resolver::LocalResolver;

/// How a task is dispatched. Fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Chat,
    /// Chat routed to the backend's developer agent.
    Dev,
    /// Fetch and summarise a URL.
    Browse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub sequence: u64,
    pub payload: String,
    pub mode: TaskMode,
}

impl Task {
    fn wire_prompt(&self) -> String {
        match self.mode {
            TaskMode::Dev => format!("{}{}", api::DEV_PREFIX, self.payload),
            TaskMode::Chat | TaskMode::Browse => self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRunState {
    Idle,
    Draining,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Local,
    Backend,
}

#[derive(Debug)]
pub enum TaskFailure {
    /// The backend answered with an error.
    Refused(String),
    Call(CallError),
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused(message) => f.write_str(message),
            Self::Call(e) => write!(f, "{e}"),
        }
    }
}

/// Progress reported to the UI, in order.
#[derive(Debug)]
pub enum TaskEvent {
    Started {
        sequence: u64,
        mode: TaskMode,
    },
    Delivered {
        sequence: u64,
        text: String,
        source: ReplySource,
    },
    Failed {
        sequence: u64,
        failure: TaskFailure,
    },
    Cancelled {
        discarded: usize,
        in_flight: Option<u64>,
    },
}

/// What a call to [`TaskQueue::cancel`] dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelSummary {
    pub discarded: usize,
    pub in_flight: Option<u64>,
}

struct QueueState {
    run_state: QueueRunState,
    pending: VecDeque<Task>,
    in_flight: Option<u64>,
    next_sequence: u64,
    epoch: u64,
}

struct Shared {
    backend: Arc<dyn CallHandle>,
    resolver: Option<Arc<dyn LocalResolver>>,
    events: mpsc::UnboundedSender<TaskEvent>,
    state: Mutex<QueueState>,
}

impl Shared {
    fn emit(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Task event receiver dropped");
        }
    }
}

/// FIFO queue with a single consumer. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// `backend` is normally the [`ServiceProxy`](crate::proxy::ServiceProxy),
    /// so each task uses whatever binding is current when it is dequeued.
    pub fn new(
        backend: Arc<dyn CallHandle>,
        resolver: Option<Arc<dyn LocalResolver>>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            backend,
            resolver,
            events,
            state: Mutex::new(QueueState {
                run_state: QueueRunState::Idle,
                pending: VecDeque::new(),
                in_flight: None,
                next_sequence: 1,
                epoch: 0,
            }),
        });
        (Self { shared }, rx)
    }

    /// Enqueue a task and return its sequence number. Never waits on the
    /// backend. Must be called from within a tokio runtime.
    pub fn submit(&self, payload: &str, mode: TaskMode) -> Result<u64, SubmitError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(SubmitError::Empty);
        }

        let mut state = self.shared.state.lock();
        let task = Task {
            sequence: state.next_sequence,
            payload: payload.to_string(),
            mode,
        };
        let size = task.wire_prompt().len();
        if size > api::MAX_PROMPT_BYTES {
            return Err(SubmitError::PayloadTooLarge {
                size,
                max: api::MAX_PROMPT_BYTES,
            });
        }

        let sequence = task.sequence;
        state.next_sequence += 1;
        state.pending.push_back(task);
        tracing::debug!(sequence, ?mode, pending = state.pending.len(), "Task queued");

        if state.run_state == QueueRunState::Idle {
            state.run_state = QueueRunState::Draining;
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        Ok(sequence)
    }

    /// Stop pulling work, drop everything pending, and discard the result of
    /// the call in flight when it arrives.
    pub fn cancel(&self) -> CancelSummary {
        let mut state = self.shared.state.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        let in_flight = state.in_flight;

        if state.run_state != QueueRunState::Idle {
            state.epoch += 1;
            if in_flight.is_some() {
                state.run_state = QueueRunState::Cancelling;
            }
        }

        tracing::debug!(discarded, ?in_flight, "Queue cancelled");
        self.shared.emit(TaskEvent::Cancelled {
            discarded,
            in_flight,
        });
        CancelSummary {
            discarded,
            in_flight,
        }
    }

    pub fn run_state(&self) -> QueueRunState {
        self.shared.state.lock().run_state
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.shared.state.lock().in_flight
    }
}

/// The consumer loop. Exactly one runs while the queue is not `Idle`.
async fn drain(shared: Arc<Shared>) {
    loop {
        let (task, epoch) = {
            let mut state = shared.state.lock();
            match state.pending.pop_front() {
                Some(task) => {
                    state.run_state = QueueRunState::Draining;
                    state.in_flight = Some(task.sequence);
                    (task, state.epoch)
                }
                None => {
                    state.run_state = QueueRunState::Idle;
                    state.in_flight = None;
                    tracing::debug!("Queue drained");
                    return;
                }
            }
        };

        shared.emit(TaskEvent::Started {
            sequence: task.sequence,
            mode: task.mode,
        });
        let event = execute(&shared, &task).await;

        let mut state = shared.state.lock();
        state.in_flight = None;
        if state.epoch != epoch {
            tracing::debug!(sequence = task.sequence, "Discarding result of cancelled task");
            continue;
        }
        // Emitted under the lock so a concurrent cancel cannot slip between
        // the epoch check and delivery.
        shared.emit(event);
    }
}

async fn execute(shared: &Shared, task: &Task) -> TaskEvent {
    let sequence = task.sequence;

    if task.mode == TaskMode::Chat
        && let Some(resolver) = &shared.resolver
    {
        match resolver.resolve(&task.payload) {
            Ok(Some(text)) => {
                return TaskEvent::Delivered {
                    sequence,
                    text,
                    source: ReplySource::Local,
                };
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(sequence, error = %e, "Local resolver failed"),
        }
    }

    let (operation, args) = match task.mode {
        TaskMode::Chat | TaskMode::Dev => (api::CHAT, json!({ "prompt": task.wire_prompt() })),
        TaskMode::Browse => (api::BROWSE, json!({ "url": task.payload })),
    };

    match shared.backend.call(operation, args).await {
        Ok(reply) => match reply.into_text() {
            Ok(text) => TaskEvent::Delivered {
                sequence,
                text,
                source: ReplySource::Backend,
            },
            Err(message) => TaskEvent::Failed {
                sequence,
                failure: TaskFailure::Refused(message),
            },
        },
        Err(e) => {
            tracing::warn!(sequence, error = %e, "Task call failed");
            TaskEvent::Failed {
                sequence,
                failure: TaskFailure::Call(e),
            }
        }
    }
}
