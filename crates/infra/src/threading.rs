//! Execution domains
//!
//! - [`RequestLoop`]: the single request thread. It runs posted closures and
//!   drains [`MixEvent`]s from mix domains, in arrival order.
//! - [`MixDomain`]: a dedicated thread driving a current-thread tokio runtime.
//!   Each capturer's [`CaptureMixer`] becomes one task on it, so a mixer is
//!   only ever processed from that one thread.

use chorale_core::domain::capturer::{CaptureMixer, MixEvent, ProcessOutcome};
use chorale_core::domain::clock::Clock;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, trace};

pub type Result<T> = std::result::Result<T, ThreadingError>;

#[derive(Debug, Error)]
pub enum ThreadingError {
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Execution domain is closed")]
    Closed,
}

type Task = Box<dyn FnOnce() + Send>;

/// Single consumer for client requests and mix completions
pub struct RequestLoop {
    tasks: Option<Sender<Task>>,
    thread: Option<JoinHandle<()>>,
}

impl RequestLoop {
    pub fn spawn(events: Receiver<MixEvent>) -> Result<Self> {
        let (tasks, task_rx) = channel::unbounded::<Task>();
        let thread = thread::Builder::new()
            .name("chorale-request".to_string())
            .spawn(move || run_request_loop(task_rx, events))?;

        info!("Request loop started");
        Ok(Self {
            tasks: Some(tasks),
            thread: Some(thread),
        })
    }

    /// Queue `task` behind everything already posted
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let tasks = self.tasks.as_ref().ok_or(ThreadingError::Closed)?;
        tasks.send(Box::new(task)).map_err(|_| ThreadingError::Closed)
    }

    /// Run `f` on the request thread and wait for its result
    pub fn call<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.post(move || {
            let _ = reply_tx.send(f());
        })?;
        reply_rx.recv().map_err(|_| ThreadingError::Closed)
    }

    /// Finish queued work and join the thread
    pub fn shutdown(&mut self) {
        self.tasks.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Request loop panicked");
            }
            info!("Request loop stopped");
        }
    }
}

impl Drop for RequestLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_request_loop(tasks: Receiver<Task>, events: Receiver<MixEvent>) {
    let mut events = events;
    loop {
        channel::select! {
            recv(tasks) -> task => match task {
                Ok(task) => task(),
                Err(_) => break,
            },
            recv(events) -> event => match event {
                Ok(event) => {
                    trace!(kind = ?event.kind, "Dispatching mix event");
                    event.dispatch();
                }
                Err(_) => {
                    debug!("Mix event channel closed");
                    events = channel::never();
                }
            },
        }
    }

    // Completions that raced with shutdown still reach their clients.
    for event in events.try_iter() {
        event.dispatch();
    }
}

/// Thread hosting mix tasks on a current-thread runtime
pub struct MixDomain {
    handle: tokio::runtime::Handle,
    clock: Arc<dyn Clock>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MixDomain {
    pub fn spawn(name: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let (handle_tx, handle_rx) = channel::bounded(1);
        let (stop, stop_rx) = oneshot::channel::<()>();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("chorale-mix-{name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
                debug!(domain = %thread_name, "Mix domain runtime stopped");
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| ThreadingError::Closed)??;

        info!(domain = name, "Mix domain started");
        Ok(Self {
            handle,
            clock,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Drive `mixer` on this domain until its capturer shuts down
    pub fn run_capturer(&self, mixer: CaptureMixer) -> tokio::task::JoinHandle<()> {
        let wakeup = mixer.capturer().wakeup().clone();
        let clock = self.clock.clone();
        self.handle.spawn(run_capture_mixer(mixer, wakeup, clock))
    }

    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Mix domain panicked");
            }
        }
    }
}

impl Drop for MixDomain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_capture_mixer(mut mixer: CaptureMixer, wakeup: Arc<Notify>, clock: Arc<dyn Clock>) {
    let id = mixer.capturer().id();
    debug!(capturer = %id, "Capture mix task started");

    loop {
        match mixer.process() {
            ProcessOutcome::Stopped => break,
            ProcessOutcome::Idle => wakeup.notified().await,
            ProcessOutcome::WakeAt(deadline) => {
                let delay = clock.duration_until(deadline);
                tokio::select! {
                    _ = wakeup.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(capturer = %id, "Capture mix task finished");
}
