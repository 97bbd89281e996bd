//! Background actor that runs format jobs keyed by product id.
//!
//! A product is never queued twice. A save that arrives while the product is
//! being processed schedules exactly one re-run after the current one ends.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::notices::{Notice, NoticeBoard, NoticeLevel};
use super::processor::{FormatProcessor, ProcessReport, SkipReason};
use super::FormatError;
use crate::catalog::ProductId;

/// Work the actor schedules per product.
#[async_trait]
pub trait FormatJob: Send + Sync {
    async fn run(&self, product_id: ProductId) -> Result<ProcessReport, FormatError>;
}

#[async_trait]
impl FormatJob for FormatProcessor {
    async fn run(&self, product_id: ProductId) -> Result<ProcessReport, FormatError> {
        self.process_product(product_id).await
    }
}

/// Result of asking the worker to process a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already waiting in the queue.
    AlreadyQueued,
    /// Currently running; one more run follows.
    RerunScheduled,
}

enum WorkerCommand {
    Enqueue {
        product_id: ProductId,
        responder: oneshot::Sender<EnqueueOutcome>,
    },
    WhenIdle {
        responder: oneshot::Sender<()>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the format worker actor.
#[derive(Clone)]
pub struct FormatWorkerHandle {
    sender: mpsc::Sender<WorkerCommand>,
}

impl FormatWorkerHandle {
    /// Schedules a product for processing.
    ///
    /// # Errors
    ///
    /// - `FormatError::WorkerShutdown` - Actor is no longer running
    pub async fn enqueue(&self, product_id: ProductId) -> Result<EnqueueOutcome, FormatError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::Enqueue {
                product_id,
                responder,
            })
            .await
            .map_err(|_| FormatError::WorkerShutdown)?;

        rx.await.map_err(|_| FormatError::WorkerShutdown)
    }

    /// Resolves once nothing is queued or running.
    ///
    /// # Errors
    ///
    /// - `FormatError::WorkerShutdown` - Actor is no longer running
    pub async fn wait_idle(&self) -> Result<(), FormatError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::WhenIdle { responder })
            .await
            .map_err(|_| FormatError::WorkerShutdown)?;

        rx.await.map_err(|_| FormatError::WorkerShutdown)
    }

    /// Drops queued work, waits for running jobs, then stops the actor.
    ///
    /// # Errors
    ///
    /// - `FormatError::WorkerShutdown` - Actor already stopped
    pub async fn shutdown(&self) -> Result<(), FormatError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::Shutdown { responder })
            .await
            .map_err(|_| FormatError::WorkerShutdown)?;

        rx.await.map_err(|_| FormatError::WorkerShutdown)
    }
}

/// Spawns the format worker actor and returns its handle.
pub fn spawn_format_worker(
    job: Arc<dyn FormatJob>,
    notices: NoticeBoard,
    max_concurrent: usize,
) -> FormatWorkerHandle {
    let (sender, receiver) = mpsc::channel(100);
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();

    let state = WorkerState {
        job,
        notices,
        max_concurrent: max_concurrent.max(1),
        queue: VecDeque::new(),
        running: HashSet::new(),
        rerun: HashSet::new(),
        idle_waiters: Vec::new(),
        shutdown: None,
        finished_tx,
    };

    tokio::spawn(async move {
        run_actor_loop(state, receiver, finished_rx).await;
    });

    FormatWorkerHandle { sender }
}

struct WorkerState {
    job: Arc<dyn FormatJob>,
    notices: NoticeBoard,
    max_concurrent: usize,
    queue: VecDeque<ProductId>,
    running: HashSet<ProductId>,
    rerun: HashSet<ProductId>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    finished_tx: mpsc::UnboundedSender<ProductId>,
}

impl WorkerState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    fn enqueue(&mut self, product_id: ProductId) -> EnqueueOutcome {
        if self.running.contains(&product_id) {
            self.rerun.insert(product_id);
            return EnqueueOutcome::RerunScheduled;
        }
        if self.queue.contains(&product_id) {
            return EnqueueOutcome::AlreadyQueued;
        }
        self.queue.push_back(product_id);
        EnqueueOutcome::Queued
    }

    fn dispatch(&mut self) {
        while self.running.len() < self.max_concurrent {
            let Some(product_id) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(product_id);

            let job = Arc::clone(&self.job);
            let notices = self.notices.clone();
            let finished = self.finished_tx.clone();
            tokio::spawn(async move {
                let result = job.run(product_id).await;
                report(&notices, product_id, result);
                let _ = finished.send(product_id);
            });
        }
    }

    fn finished(&mut self, product_id: ProductId) {
        self.running.remove(&product_id);
        if self.rerun.remove(&product_id) && self.shutdown.is_none() {
            tracing::debug!("Re-running formats for product {}", product_id);
            self.queue.push_back(product_id);
        }
    }

    fn notify_idle(&mut self) {
        if self.is_idle() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

async fn run_actor_loop(
    mut state: WorkerState,
    mut receiver: mpsc::Receiver<WorkerCommand>,
    mut finished_rx: mpsc::UnboundedReceiver<ProductId>,
) {
    tracing::debug!("Format worker started");

    loop {
        tokio::select! {
            Some(command) = receiver.recv(), if state.shutdown.is_none() => {
                match command {
                    WorkerCommand::Enqueue { product_id, responder } => {
                        let outcome = state.enqueue(product_id);
                        tracing::debug!("Product {} save: {:?}", product_id, outcome);
                        let _ = responder.send(outcome);
                    }
                    WorkerCommand::WhenIdle { responder } => {
                        state.idle_waiters.push(responder);
                    }
                    WorkerCommand::Shutdown { responder } => {
                        state.queue.clear();
                        state.rerun.clear();
                        state.shutdown = Some(responder);
                    }
                }
            }
            Some(product_id) = finished_rx.recv() => {
                state.finished(product_id);
            }
            else => break,
        }

        if state.shutdown.is_none() {
            state.dispatch();
        }
        state.notify_idle();

        if state.running.is_empty()
            && let Some(responder) = state.shutdown.take()
        {
            let _ = responder.send(());
            break;
        }
    }

    tracing::debug!("Format worker stopped");
}

fn report(notices: &NoticeBoard, product_id: ProductId, result: Result<ProcessReport, FormatError>) {
    match result {
        Ok(ProcessReport::Skipped(reason)) => {
            tracing::debug!("Formats for product {} skipped: {:?}", product_id, reason);
            if reason == SkipReason::NoAudio {
                notices.post(Notice::new(
                    product_id,
                    NoticeLevel::Info,
                    "No downloadable audio, formats were not generated",
                ));
            }
        }
        Ok(ProcessReport::Completed(summary)) => {
            for failure in &summary.failures {
                notices.post(Notice::new(product_id, NoticeLevel::Warning, failure.to_string()));
            }
            let formats: Vec<&str> = summary.archives.iter().map(|f| f.extension()).collect();
            notices.post(Notice::new(
                product_id,
                NoticeLevel::Info,
                format!("Formats generated: {}", formats.join(", ")),
            ));
        }
        Err(e @ FormatError::TranscoderNotConfigured { .. }) => {
            notices.post(Notice::new(product_id, NoticeLevel::Warning, e.to_string()));
        }
        Err(e) => {
            notices.post(Notice::new(product_id, NoticeLevel::Error, e.to_string()));
        }
    }
}
