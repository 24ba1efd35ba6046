// SPDX-License-Identifier: MPL-2.0

//! Recording session state machine
//!
//! ```text
//!            start (worker not ready)
//!  Stopped ─────────────────────────► Starting
//!     ▲  │ start (ready)                 │ worker ready
//!     │  └──────────────► Running ◄──────┘
//!     │                      │ stop
//!     │   drain complete     ▼
//!     └─────────────────  Stopping ──► Running (pending session)
//! ```
//!
//! Every transition happens under one lock and is published once through a
//! watch channel. A stop that settles straight into a queued session goes
//! from `Stopping` to `Running` without publishing `Stopped` in between.

use crate::config::RecordingSession;
use crate::errors::{RecordingError, RecordingResult};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Whatever owns the video surface and can run a recording pipeline
pub trait RecordingTarget: Send + Sync {
    /// Post the creation of a pipeline for `session`; returns before it exists
    fn begin_recording(&self, session: RecordingSession);

    /// Stop the active pipeline and resolve once the container is finalized
    fn finish_recording(&self) -> BoxFuture<'static, RecordingResult<PathBuf>>;
}

/// Recording lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Stopped,
    /// A session is waiting for the render worker
    Starting,
    Running,
    /// The active session is draining
    Stopping,
}

type DrainFuture = Shared<BoxFuture<'static, RecordingResult<Option<PathBuf>>>>;

struct Inner {
    state: RecordingState,
    pending: Option<RecordingSession>,
    target: Option<Arc<dyn RecordingTarget>>,
    drain: Option<DrainFuture>,
}

struct ControllerShared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<RecordingState>,
    runtime: Handle,
}

impl ControllerShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &mut Inner, state: RecordingState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Recording state transition");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Drain finished: go idle, or straight into the queued session
    fn settle(&self) {
        let mut inner = self.lock();
        inner.drain = None;
        let next = inner.pending.take();
        match (next, inner.target.clone()) {
            (Some(session), Some(target)) => {
                info!(output = %session.output.display(), "Starting queued recording");
                target.begin_recording(session);
                self.publish(&mut inner, RecordingState::Running);
            }
            _ => self.publish(&mut inner, RecordingState::Stopped),
        }
    }
}

/// Owns the recording state and at most one active session
#[derive(Clone)]
pub struct RecordingController {
    shared: Arc<ControllerShared>,
}

impl RecordingController {
    /// Create a stopped controller; drain tasks run on `runtime`
    pub fn new(runtime: Handle) -> Self {
        let (state_tx, _) = watch::channel(RecordingState::Stopped);
        Self {
            shared: Arc::new(ControllerShared {
                inner: Mutex::new(Inner {
                    state: RecordingState::Stopped,
                    pending: None,
                    target: None,
                    drain: None,
                }),
                state_tx,
                runtime,
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.lock().state
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.shared.state_tx.subscribe()
    }

    /// Request a recording
    ///
    /// Ignored while a session is running. While stopping, the session is
    /// queued and starts as soon as the current one is finalized.
    pub fn start(&self, session: RecordingSession) {
        let shared = &self.shared;
        let mut inner = shared.lock();

        match inner.state {
            RecordingState::Stopped | RecordingState::Starting => match inner.target.clone() {
                Some(target) => {
                    inner.pending = None;
                    info!(output = %session.output.display(), "Starting recording");
                    target.begin_recording(session);
                    shared.publish(&mut inner, RecordingState::Running);
                }
                None => {
                    debug!("Render worker not ready, deferring recording");
                    inner.pending = Some(session);
                    shared.publish(&mut inner, RecordingState::Starting);
                }
            },
            RecordingState::Running => {
                warn!("Recording already running, start ignored");
            }
            RecordingState::Stopping => {
                debug!("Queueing recording until the current one is finalized");
                inner.pending = Some(session);
            }
        }
    }

    /// Request the active recording to stop
    ///
    /// The returned handle resolves with the finalized file, `None` when no
    /// session was running, or the session's error. Dropping the handle
    /// does not cancel the drain.
    pub fn stop(&self) -> StopHandle {
        let shared = &self.shared;
        let mut inner = shared.lock();

        match inner.state {
            RecordingState::Stopped => StopHandle::ready(Ok(None)),
            RecordingState::Starting => {
                inner.pending = None;
                shared.publish(&mut inner, RecordingState::Stopped);
                StopHandle::ready(Ok(None))
            }
            RecordingState::Stopping => match &inner.drain {
                Some(drain) => StopHandle::from_drain(drain.clone()),
                None => StopHandle::ready(Ok(None)),
            },
            RecordingState::Running => {
                let Some(target) = inner.target.clone() else {
                    shared.publish(&mut inner, RecordingState::Stopped);
                    return StopHandle::ready(Err(RecordingError::WorkerUnavailable));
                };

                info!("Stopping recording");
                let finish = target.finish_recording();
                let settle = Arc::clone(shared);
                let task = shared.runtime.spawn(async move {
                    let result = finish.await;
                    settle.settle();
                    result
                });

                let drain: DrainFuture = async move {
                    match task.await {
                        Ok(result) => result.map(Some),
                        Err(e) => Err(e.into()),
                    }
                }
                .boxed()
                .shared();

                inner.drain = Some(drain.clone());
                shared.publish(&mut inner, RecordingState::Stopping);
                StopHandle::from_drain(drain)
            }
        }
    }

    /// The render worker can now host a recording pipeline
    pub fn worker_ready(&self, target: Arc<dyn RecordingTarget>) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.target = Some(Arc::clone(&target));

        if inner.state == RecordingState::Starting {
            match inner.pending.take() {
                Some(session) => {
                    info!(output = %session.output.display(), "Starting deferred recording");
                    target.begin_recording(session);
                    shared.publish(&mut inner, RecordingState::Running);
                }
                None => shared.publish(&mut inner, RecordingState::Stopped),
            }
        }
    }
}

/// Awaitable result of [`RecordingController::stop`]
#[must_use = "await the handle to know when the file is finalized"]
pub struct StopHandle {
    inner: BoxFuture<'static, RecordingResult<Option<PathBuf>>>,
}

impl StopHandle {
    fn ready(result: RecordingResult<Option<PathBuf>>) -> Self {
        Self {
            inner: futures::future::ready(result).boxed(),
        }
    }

    fn from_drain(drain: DrainFuture) -> Self {
        Self {
            inner: drain.boxed(),
        }
    }
}

impl Future for StopHandle {
    type Output = RecordingResult<Option<PathBuf>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockTarget {
        begun: Mutex<Vec<PathBuf>>,
        finished: Mutex<u32>,
        /// When set, finishing waits for a notification
        gate: Option<Arc<Notify>>,
        fail: Option<RecordingError>,
    }

    impl MockTarget {
        fn begun(&self) -> Vec<PathBuf> {
            self.begun.lock().unwrap().clone()
        }
    }

    impl RecordingTarget for MockTarget {
        fn begin_recording(&self, session: RecordingSession) {
            self.begun.lock().unwrap().push(session.output);
        }

        fn finish_recording(&self) -> BoxFuture<'static, RecordingResult<PathBuf>> {
            *self.finished.lock().unwrap() += 1;
            let path = self.begun().last().cloned().unwrap_or_default();
            let gate = self.gate.clone();
            let fail = self.fail.clone();
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                match fail {
                    Some(e) => Err(e),
                    None => Ok(path),
                }
            }
            .boxed()
        }
    }

    fn session(name: &str) -> RecordingSession {
        RecordingSession::new(format!("/tmp/{name}.mp4"))
    }

    #[tokio::test]
    async fn test_start_waits_for_worker() {
        let controller = RecordingController::new(Handle::current());
        controller.start(session("a"));
        assert_eq!(controller.state(), RecordingState::Starting);

        let target = Arc::new(MockTarget::default());
        controller.worker_ready(target.clone());
        assert_eq!(controller.state(), RecordingState::Running);
        assert_eq!(target.begun(), vec![PathBuf::from("/tmp/a.mp4")]);
    }

    #[tokio::test]
    async fn test_start_replaces_stashed_session() {
        let controller = RecordingController::new(Handle::current());
        controller.start(session("a"));
        controller.start(session("b"));

        let target = Arc::new(MockTarget::default());
        controller.worker_ready(target.clone());
        assert_eq!(target.begun(), vec![PathBuf::from("/tmp/b.mp4")]);
    }

    #[tokio::test]
    async fn test_stop_while_starting_never_creates_pipeline() {
        let controller = RecordingController::new(Handle::current());
        controller.start(session("a"));
        assert_eq!(controller.stop().await, Ok(None));
        assert_eq!(controller.state(), RecordingState::Stopped);

        let target = Arc::new(MockTarget::default());
        controller.worker_ready(target.clone());
        assert_eq!(controller.state(), RecordingState::Stopped);
        assert!(target.begun().is_empty());
    }

    #[tokio::test]
    async fn test_stop_resolves_with_output() {
        let controller = RecordingController::new(Handle::current());
        let target = Arc::new(MockTarget::default());
        controller.worker_ready(target.clone());

        controller.start(session("a"));
        assert_eq!(controller.state(), RecordingState::Running);

        // A second start is ignored while running
        controller.start(session("b"));
        assert_eq!(target.begun().len(), 1);

        let output = controller.stop().await.unwrap();
        assert_eq!(output, Some(PathBuf::from("/tmp/a.mp4")));
        assert_eq!(controller.state(), RecordingState::Stopped);
        assert_eq!(*target.finished.lock().unwrap(), 1);

        // Stopping again is a no-op
        assert_eq!(controller.stop().await, Ok(None));
    }

    #[tokio::test]
    async fn test_start_during_stop_restarts_in_same_settle() {
        let gate = Arc::new(Notify::new());
        let target = Arc::new(MockTarget {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let controller = RecordingController::new(Handle::current());
        controller.worker_ready(target.clone());
        controller.start(session("a"));

        let first = controller.stop();
        assert_eq!(controller.state(), RecordingState::Stopping);

        controller.start(session("b"));
        assert_eq!(controller.state(), RecordingState::Stopping);

        // stop() while stopping shares the in-flight drain
        let second = controller.stop();

        let mut rx = controller.subscribe();
        rx.borrow_and_update();

        gate.notify_one();
        assert_eq!(first.await, Ok(Some(PathBuf::from("/tmp/a.mp4"))));
        assert_eq!(second.await, Ok(Some(PathBuf::from("/tmp/a.mp4"))));

        assert_eq!(controller.state(), RecordingState::Running);
        assert_eq!(*rx.borrow_and_update(), RecordingState::Running);
        assert_eq!(
            target.begun(),
            vec![PathBuf::from("/tmp/a.mp4"), PathBuf::from("/tmp/b.mp4")]
        );
        assert_eq!(*target.finished.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_error_surfaces_from_stop() {
        let target = Arc::new(MockTarget {
            fail: Some(RecordingError::DuplicateFormatChange(TrackKind::Video)),
            ..Default::default()
        });
        let controller = RecordingController::new(Handle::current());
        controller.worker_ready(target);
        controller.start(session("a"));

        let err = controller.stop().await.unwrap_err();
        assert_eq!(err, RecordingError::DuplicateFormatChange(TrackKind::Video));
        assert_eq!(controller.state(), RecordingState::Stopped);
    }
}
