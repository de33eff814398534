//! Per-capability batch queues and their background workers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use conductor_types::config::BatchConfig;
use conductor_types::error::ExecutorError;
use conductor_types::task::{Capability, Task, TaskOutput};

use super::sizing::AdaptiveBatchSize;
use crate::context::ContextView;
use crate::error::StepError;
use crate::executor::{BatchItem, ExecutorRegistry};

struct PendingTask {
    item: BatchItem,
    respond: oneshot::Sender<Result<TaskOutput, StepError>>,
}

type SharedSize = Arc<Mutex<AdaptiveBatchSize>>;

/// Groups compatible tasks into windows and dispatches them together.
///
/// Queues and workers are created lazily on the first submission for a
/// capability. `shutdown` closes every queue; workers drain what was already
/// queued and exit.
pub struct BatchAggregator {
    registry: Arc<ExecutorRegistry>,
    config: BatchConfig,
    queues: DashMap<Capability, mpsc::UnboundedSender<PendingTask>>,
    sizes: DashMap<Capability, SharedSize>,
}

impl BatchAggregator {
    pub fn new(registry: Arc<ExecutorRegistry>, config: BatchConfig) -> Self {
        Self {
            registry,
            config,
            queues: DashMap::new(),
            sizes: DashMap::new(),
        }
    }

    /// Queue a task and wait for its share of the batch result.
    pub async fn submit(&self, task: Task, context: Arc<ContextView>) -> Result<TaskOutput, StepError> {
        // Unknown capabilities fail here rather than inside a window.
        self.registry.resolve(&task.capability)?;

        let (respond, response) = oneshot::channel();
        let sender = self.queue(&task.capability);
        sender
            .send(PendingTask {
                item: BatchItem { task, context },
                respond,
            })
            .map_err(|_| StepError::from(ExecutorError::transient("batch queue closed")))?;

        response
            .await
            .map_err(|_| StepError::from(ExecutorError::transient("batch worker dropped the task")))?
    }

    /// Current target window size for a capability.
    pub fn batch_size(&self, capability: &Capability) -> usize {
        self.sizes
            .get(capability)
            .map(|size| lock(&size).current())
            .unwrap_or_else(|| AdaptiveBatchSize::new(&self.config).current())
    }

    /// Close every queue. Already queued tasks are still dispatched.
    pub fn shutdown(&self) {
        let open = self.queues.len();
        self.queues.clear();
        tracing::debug!(queues = open, "batch queues closed");
    }

    fn queue(&self, capability: &Capability) -> mpsc::UnboundedSender<PendingTask> {
        self.queues
            .entry(capability.clone())
            .and_modify(|sender| {
                if sender.is_closed() {
                    *sender = self.spawn_worker(capability);
                }
            })
            .or_insert_with(|| self.spawn_worker(capability))
            .clone()
    }

    fn spawn_worker(&self, capability: &Capability) -> mpsc::UnboundedSender<PendingTask> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let size = self
            .sizes
            .entry(capability.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AdaptiveBatchSize::new(&self.config))))
            .clone();
        tokio::spawn(run_worker(
            capability.clone(),
            Arc::clone(&self.registry),
            size,
            Duration::from_millis(self.config.window_ms),
            receiver,
        ));
        tracing::debug!(capability = %capability, "batch worker started");
        sender
    }
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("queues", &self.queues.len())
            .field("config", &self.config)
            .finish()
    }
}

fn lock(size: &SharedSize) -> MutexGuard<'_, AdaptiveBatchSize> {
    size.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_worker(
    capability: Capability,
    registry: Arc<ExecutorRegistry>,
    size: SharedSize,
    window: Duration,
    mut receiver: mpsc::UnboundedReceiver<PendingTask>,
) {
    while let Some(first) = receiver.recv().await {
        let target = lock(&size).current();
        let mut window_tasks = vec![first];
        let deadline = tokio::time::Instant::now() + window;

        while window_tasks.len() < target {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(pending)) => window_tasks.push(pending),
                Ok(None) | Err(_) => break,
            }
        }

        tokio::spawn(dispatch(
            capability.clone(),
            Arc::clone(&registry),
            Arc::clone(&size),
            window_tasks,
        ));
    }
    tracing::debug!(capability = %capability, "batch worker stopped");
}

async fn dispatch(
    capability: Capability,
    registry: Arc<ExecutorRegistry>,
    size: SharedSize,
    window_tasks: Vec<PendingTask>,
) {
    let (items, responders): (Vec<BatchItem>, Vec<_>) = window_tasks
        .into_iter()
        .map(|pending| (pending.item, pending.respond))
        .unzip();

    let executor = match registry.resolve(&capability) {
        Ok(executor) => executor,
        Err(err) => {
            for respond in responders {
                let _ = respond.send(Err(err.clone().into()));
            }
            return;
        }
    };

    let started = Instant::now();
    let raw = executor.execute_batch(&items).await;
    let latency = started.elapsed();

    let results: Vec<Result<TaskOutput, StepError>> = if raw.len() == items.len() {
        raw.into_iter().map(|r| r.map_err(StepError::from)).collect()
    } else {
        tracing::error!(
            capability = %capability,
            expected = items.len(),
            returned = raw.len(),
            "batch executor returned a mismatched result count"
        );
        let message = format!(
            "batch executor returned {} results for {} tasks",
            raw.len(),
            items.len()
        );
        items
            .iter()
            .map(|_| Err(ExecutorError::permanent(message.clone()).into()))
            .collect()
    };

    let failures = results.iter().filter(|r| r.is_err()).count();
    let next_size = lock(&size).record(items.len(), failures, latency);
    tracing::debug!(
        capability = %capability,
        batch = items.len(),
        failures,
        latency_ms = latency.as_millis() as u64,
        next_size,
        "batch dispatched"
    );

    for ((item, respond), result) in items.iter().zip(responders).zip(results) {
        let result = result.map(|mut output| {
            output.proposals.extend(item.context.take_proposals());
            output
        });
        let _ = respond.send(result);
    }
}
