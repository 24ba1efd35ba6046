// SPDX-License-Identifier: GPL-3.0-only

//! Single-threaded render worker
//!
//! The worker owns one piece of state (the graphics context and everything
//! built on it) on a dedicated thread. Work is posted as closures and runs
//! in submission order. A closure that returns an error is fatal: the state
//! is released, the status flips to [`WorkerStatus::Failed`] and later work
//! is rejected.

use crate::errors::{GpuError, GpuResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// State owned by a worker thread
pub trait WorkerState: Send + 'static {
    /// Free every resource; called exactly once, on the worker thread
    fn release(&mut self);
}

/// Lifecycle of a worker as seen from other threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Initialization has not finished
    Starting,
    /// Accepting work
    Ready,
    /// Initialization or a unit of work failed; state was released
    Failed(String),
    /// Released on request
    Released,
}

type Job<S> = Box<dyn FnOnce(&mut S) -> GpuResult<()> + Send>;

enum Message<S> {
    Run(Job<S>),
    Release(oneshot::Sender<()>),
}

/// Result of a [`GpuWorker::call`], fulfilled on the worker thread
///
/// Resolves to [`GpuError::Released`] if the worker stopped before the
/// work ran.
pub struct Pending<T> {
    rx: oneshot::Receiver<GpuResult<T>>,
}

impl<T> Pending<T> {
    fn new(rx: oneshot::Receiver<GpuResult<T>>) -> Self {
        Self { rx }
    }

    fn ready(value: GpuResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }
}

impl<T> Future for Pending<T> {
    type Output = GpuResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(GpuError::Released)))
    }
}

struct Inner<S> {
    name: String,
    jobs: Mutex<Option<mpsc::UnboundedSender<Message<S>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        // Closing the channel lets the thread release its state and exit
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Render worker thread panicked: {:?}", e);
            }
        }
    }
}

/// Handle to a render worker; clones share the same thread
pub struct GpuWorker<S> {
    inner: Arc<Inner<S>>,
    status: watch::Receiver<WorkerStatus>,
}

impl<S> Clone for GpuWorker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            status: self.status.clone(),
        }
    }
}

impl<S: WorkerState> GpuWorker<S> {
    /// Start the worker thread
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name, also used in logs
    /// * `init` - Builds the state on the worker thread
    ///
    /// # Returns
    ///
    /// A handle that can be used immediately; work posted before `init`
    /// finishes runs after it. Initialization failure is reported through
    /// [`GpuWorker::wait_ready`] and rejects all queued work.
    pub fn spawn<I>(name: &str, init: I) -> GpuResult<Self>
    where
        I: FnOnce() -> GpuResult<S> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<S>>();
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Starting);
        let thread_name = name.to_string();

        info!(name = %name, "Starting render worker");

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = match init() {
                    Ok(state) => {
                        debug!(name = %thread_name, "Render worker initialized");
                        state
                    }
                    Err(e) => {
                        error!(name = %thread_name, error = %e, "Render worker initialization failed");
                        rx.close();
                        status_tx.send_replace(WorkerStatus::Failed(e.to_string()));
                        return;
                    }
                };
                status_tx.send_replace(WorkerStatus::Ready);

                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Run(job) => {
                            if let Err(e) = job(&mut state) {
                                error!(name = %thread_name, error = %e, "Render worker stopping after fatal error");
                                rx.close();
                                state.release();
                                status_tx.send_replace(WorkerStatus::Failed(e.to_string()));
                                return;
                            }
                        }
                        Message::Release(done) => {
                            state.release();
                            status_tx.send_replace(WorkerStatus::Released);
                            let _ = done.send(());
                            info!(name = %thread_name, "Render worker released");
                            return;
                        }
                    }
                }

                debug!(name = %thread_name, "All worker handles dropped, releasing");
                state.release();
                status_tx.send_replace(WorkerStatus::Released);
            })
            .map_err(|e| GpuError::ContextInit(format!("failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                jobs: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(handle)),
            }),
            status: status_rx,
        })
    }

    fn send(&self, message: Message<S>) -> GpuResult<()> {
        let jobs = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match jobs.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| GpuError::Released),
            None => Err(GpuError::Released),
        }
    }

    /// Post work and return immediately
    pub fn submit<F>(&self, work: F) -> GpuResult<()>
    where
        F: FnOnce(&mut S) -> GpuResult<()> + Send + 'static,
    {
        self.send(Message::Run(Box::new(work))).inspect_err(|_| {
            debug!(name = %self.inner.name, "Dropping work posted to a stopped worker");
        })
    }

    /// Post work whose result the caller wants
    ///
    /// An error from `work` is delivered to the caller and is also fatal
    /// for the worker.
    pub fn call<T, F>(&self, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> GpuResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = move |state: &mut S| match work(state) {
            Ok(value) => {
                let _ = tx.send(Ok(value));
                Ok(())
            }
            Err(e) => {
                let _ = tx.send(Err(e.clone()));
                Err(e)
            }
        };
        match self.send(Message::Run(Box::new(job))) {
            Ok(()) => Pending::new(rx),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Release the state and stop the thread
    ///
    /// The request is posted immediately; the returned future resolves once
    /// the state is gone. Idempotent, and safe to call after a failure.
    pub fn release(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let posted = self.send(Message::Release(tx)).is_ok();
        async move {
            if posted {
                // A closed channel means the worker already stopped
                let _ = rx.await;
            }
        }
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Wait until initialization finished
    pub async fn wait_ready(&self) -> GpuResult<()> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != WorkerStatus::Starting)
            .await
            .map(|s| s.clone());
        match settled {
            Ok(WorkerStatus::Ready) => Ok(()),
            Ok(WorkerStatus::Failed(msg)) => Err(GpuError::ContextInit(msg)),
            Ok(_) | Err(_) => Err(GpuError::Released),
        }
    }
}
