//! Scheduling contract used by the pool and the accepted-connection manager.
//!
//! Everything that may block (name lookup, the connect syscall) goes through
//! [`Scheduler::execute_blocking`]; continuations and handshakes run as tasks
//! through [`Scheduler::execute`]. Acceptors are registered for read
//! readiness with [`Scheduler::register`].

use crate::base::neterror::NetError;
use crate::transport::{Acceptor, Transceiver};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};

/// Back-off after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Receives the results of a registered acceptor.
pub trait AcceptHandler: Send + Sync {
    fn accepted(&self, result: Result<Box<dyn Transceiver>, NetError>);
}

/// Every continuation goes through [`execute`](Scheduler::execute); there is
/// no mode that runs one inline on the calling thread.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Runs a non-blocking task.
    fn execute(&self, task: BoxFuture<'static, ()>);

    /// Runs a job that may block its thread.
    fn execute_blocking(&self, job: Box<dyn FnOnce() + Send + 'static>);

    /// Starts accepting on `acceptor`, handing every result to `handler`
    /// until the returned registration is unregistered.
    fn register(&self, acceptor: Arc<dyn Acceptor>, handler: Arc<dyn AcceptHandler>)
        -> Registration;
}

/// An active acceptor registration.
#[derive(Debug)]
pub struct Registration {
    stop: Arc<Notify>,
    done: oneshot::Receiver<()>,
}

/// The accept-loop side of a [`Registration`]. Dropping it confirms the
/// unregistration.
#[derive(Debug)]
pub struct AcceptLoop {
    stop: Arc<Notify>,
    _done: oneshot::Sender<()>,
}

impl Registration {
    pub fn new() -> (Registration, AcceptLoop) {
        let stop = Arc::new(Notify::new());
        let (tx, rx) = oneshot::channel();
        (Registration { stop: stop.clone(), done: rx }, AcceptLoop { stop, _done: tx })
    }

    /// Asks the accept loop to stop. The returned [`Unregistering`] resolves
    /// once the loop has exited and no further `accepted` call will be made.
    pub fn unregister(self) -> Unregistering {
        self.stop.notify_one();
        Unregistering { done: Some(self.done) }
    }
}

/// Pending confirmation of an unregistration.
#[derive(Debug)]
pub struct Unregistering {
    done: Option<oneshot::Receiver<()>>,
}

impl Unregistering {
    /// Whether the accept loop has already exited.
    pub fn is_confirmed(&mut self) -> bool {
        let Some(done) = self.done.as_mut() else {
            return true;
        };
        if matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            return false;
        }
        self.done = None;
        true
    }
}

impl Future for Unregistering {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(done) = self.done.as_mut() {
            let _ = ready!(Pin::new(done).poll(cx));
            self.done = None;
        }
        Poll::Ready(())
    }
}

impl AcceptLoop {
    /// Resolves once the owning registration asks to stop.
    pub async fn stopped(&self) {
        self.stop.notified().await
    }
}

/// [`Scheduler`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self, NetError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| NetError::Config(format!("no tokio runtime: {}", e)))
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn execute_blocking(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.handle.spawn_blocking(job);
    }

    fn register(
        &self,
        acceptor: Arc<dyn Acceptor>,
        handler: Arc<dyn AcceptHandler>,
    ) -> Registration {
        let (registration, accept_loop) = Registration::new();
        tracing::debug!(endpoint = %acceptor.endpoint(), "acceptor registered");

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = accept_loop.stopped() => break,
                    result = acceptor.accept() => {
                        let failed = result.is_err();
                        handler.accepted(result);
                        if failed {
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            tracing::debug!(endpoint = %acceptor.endpoint(), "acceptor unregistered");
            drop(accept_loop);
        });

        registration
    }
}

/// Runs `job` through [`Scheduler::execute_blocking`] and waits for its
/// result without blocking the calling task.
pub(crate) async fn run_blocking<T, F>(scheduler: &dyn Scheduler, job: F) -> Result<T, NetError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    scheduler.execute_blocking(Box::new(move || {
        let _ = tx.send(job());
    }));
    rx.await.map_err(|_| {
        tracing::error!("blocking job dropped before completing");
        NetError::ConnectionAborted
    })
}
