//! Graceful shutdown coordination
//!
//! Participants register with the [`ShutdownCoordinator`] up front and get a
//! [`DrainListener`]. On a termination signal the coordinator hands every
//! participant a [`DrainRequest`] at once and waits, up to the drain timeout,
//! for each to report back. The coordinator never exits the process; the
//! caller decides what happens after [`ShutdownCoordinator::drain`] returns.
//!
//! [`ShutdownCoordinator::spawn_signal_listener`] installs the signal
//! handlers up front and drains from a background task, so a signal that
//! arrives while the process is still registering is not lost.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use regcache_common::protocol::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Notification handed to a participant when draining starts.
#[derive(Debug)]
pub struct DrainRequest {
    completion: oneshot::Sender<std::result::Result<(), String>>,
}

impl DrainRequest {
    /// Reports that the participant finished its cleanup.
    pub fn complete(self) {
        let _ = self.completion.send(Ok(()));
    }

    /// Reports that cleanup failed.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.completion.send(Err(reason.into()));
    }
}

/// Receiving side of a participant's registration.
#[derive(Debug)]
pub struct DrainListener {
    name: String,
    rx: mpsc::Receiver<DrainRequest>,
}

impl DrainListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the drain notification. `None` if the coordinator was
    /// dropped without draining.
    pub async fn recv(&mut self) -> Option<DrainRequest> {
        self.rx.recv().await
    }
}

struct Participant {
    name: String,
    tx: mpsc::Sender<DrainRequest>,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: Vec<String>,
    /// Participant name and reason
    pub failed: Vec<(String, String)>,
    pub timed_out: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }

    pub fn participants(&self) -> usize {
        self.completed.len() + self.failed.len() + self.timed_out.len()
    }
}

/// Signal that started a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    Quit,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Where a signal-driven shutdown stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining(ShutdownSignal),
    Drained(ShutdownSignal, DrainReport),
}

/// Observer of a shutdown driven by
/// [`spawn_listener`](ShutdownCoordinator::spawn_listener).
///
/// Cheap to clone; every clone sees the same progress.
#[derive(Debug, Clone)]
pub struct ShutdownProgress {
    rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownProgress {
    pub fn phase(&self) -> ShutdownPhase {
        self.rx.borrow().clone()
    }

    /// Resolves once a signal was received. `None` if the listener stopped
    /// before that.
    pub async fn signalled(&self) -> Option<ShutdownSignal> {
        let mut rx = self.rx.clone();
        let phase = rx.wait_for(|phase| *phase != ShutdownPhase::Running).await.ok()?;
        match &*phase {
            ShutdownPhase::Draining(signal) | ShutdownPhase::Drained(signal, _) => Some(*signal),
            ShutdownPhase::Running => None,
        }
    }

    /// Resolves once the drain that followed the signal finished.
    pub async fn drained(&self) -> Option<(ShutdownSignal, DrainReport)> {
        let mut rx = self.rx.clone();
        let phase = rx
            .wait_for(|phase| matches!(phase, ShutdownPhase::Drained(..)))
            .await
            .ok()?;
        match &*phase {
            ShutdownPhase::Drained(signal, report) => Some((*signal, report.clone())),
            _ => None,
        }
    }
}

enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Fans a drain notification out to every registered participant.
pub struct ShutdownCoordinator {
    participants: Mutex<Vec<Participant>>,
    drain_timeout: Duration,
    drained: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            participants: Mutex::new(Vec::new()),
            drain_timeout,
            drained: AtomicBool::new(false),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Adds a participant. Must happen before [`drain`](Self::drain).
    pub fn register(&self, name: impl Into<String>) -> DrainListener {
        let name = name.into();
        let (tx, rx) = mpsc::channel(1);
        self.lock().push(Participant {
            name: name.clone(),
            tx,
        });
        DrainListener { name, rx }
    }

    pub fn participant_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Participant>> {
        self.participants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Notifies every participant and waits for all of them, bounded by the
    /// drain timeout. Only the first call drains; later calls return an
    /// empty report.
    pub async fn drain(&self) -> DrainReport {
        if self.drained.swap(true, Ordering::SeqCst) {
            return DrainReport::default();
        }

        let participants = std::mem::take(&mut *self.lock());
        info!(
            "Draining {} participants (timeout {:?})",
            participants.len(),
            self.drain_timeout
        );

        let deadline = Instant::now() + self.drain_timeout;
        let mut pending: FuturesUnordered<_> = participants
            .into_iter()
            .map(|participant| async move {
                let outcome = notify(&participant, deadline).await;
                (participant.name, outcome)
            })
            .collect();

        let mut report = DrainReport::default();
        while let Some((name, outcome)) = pending.next().await {
            match outcome {
                Outcome::Completed => report.completed.push(name),
                Outcome::Failed(reason) => {
                    error!("Shutdown participant {} failed: {}", name, reason);
                    report.failed.push((name, reason));
                }
                Outcome::TimedOut => {
                    error!("Shutdown participant {} did not finish within {:?}", name, self.drain_timeout);
                    report.timed_out.push(name);
                }
            }
        }

        info!(
            "Drain finished: {} completed, {} failed, {} timed out",
            report.completed.len(),
            report.failed.len(),
            report.timed_out.len()
        );
        report
    }

    /// Waits for a termination signal, then drains.
    ///
    /// Signal handlers are installed only when this is called; use
    /// [`spawn_signal_listener`](Self::spawn_signal_listener) when signals
    /// must be caught from startup on.
    pub async fn run_until_signal(&self) -> Result<(ShutdownSignal, DrainReport)> {
        let signal = wait_for_signal().await?;
        info!("Received {}, shutting down", signal);
        let report = self.drain().await;
        Ok((signal, report))
    }

    /// Installs the termination-signal handlers now and drains from a
    /// background task when one arrives.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> Result<(JoinHandle<()>, ShutdownProgress)> {
        let mut watcher = SignalWatcher::install()?;
        Ok(self.spawn_listener(async move { watcher.recv().await }))
    }

    /// Drains from a background task once `trigger` resolves.
    pub fn spawn_listener<F>(self: &Arc<Self>, trigger: F) -> (JoinHandle<()>, ShutdownProgress)
    where
        F: Future<Output = ShutdownSignal> + Send + 'static,
    {
        let (tx, rx) = watch::channel(ShutdownPhase::Running);
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let signal = trigger.await;
            info!("Received {}, shutting down", signal);
            tx.send_replace(ShutdownPhase::Draining(signal));
            let report = coordinator.drain().await;
            tx.send_replace(ShutdownPhase::Drained(signal, report));
        });
        (handle, ShutdownProgress { rx })
    }
}

async fn notify(participant: &Participant, deadline: Instant) -> Outcome {
    let (completion, done) = oneshot::channel();
    let send = participant.tx.send(DrainRequest { completion });
    match tokio::time::timeout_at(deadline, send).await {
        Err(_) => return Outcome::TimedOut,
        Ok(Err(_)) => return Outcome::Failed("listener dropped".to_string()),
        Ok(Ok(())) => {}
    }

    match tokio::time::timeout_at(deadline, done).await {
        Err(_) => Outcome::TimedOut,
        Ok(Err(_)) => Outcome::Failed("drain request dropped without completion".to_string()),
        Ok(Ok(Err(reason))) => Outcome::Failed(reason),
        Ok(Ok(Ok(()))) => Outcome::Completed,
    }
}

/// Installed handlers for SIGTERM, SIGINT and SIGQUIT.
///
/// Once installed, those signals no longer terminate the process; they are
/// queued until [`recv`](Self::recv) picks them up.
#[cfg(unix)]
pub struct SignalWatcher {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalWatcher {
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.quit.recv() => ShutdownSignal::Quit,
        }
    }
}

/// Ctrl-C watcher; the only signal available on this platform.
#[cfg(not(unix))]
pub struct SignalWatcher {
    _installed: (),
}

#[cfg(not(unix))]
impl SignalWatcher {
    pub fn install() -> Result<Self> {
        warn!("Only Ctrl-C is watched on this platform");
        Ok(Self { _installed: () })
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
        ShutdownSignal::Interrupt
    }
}

/// Resolves on SIGTERM, SIGINT or SIGQUIT (Ctrl-C elsewhere).
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    let mut watcher = SignalWatcher::install()?;
    Ok(watcher.recv().await)
}

/// Convenience for participants that only need to run one async cleanup.
pub async fn serve_drain<F, Fut>(mut listener: DrainListener, cleanup: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<(), String>>,
{
    let Some(request) = listener.recv().await else {
        warn!("Coordinator for {} dropped before draining", listener.name());
        return;
    };
    match cleanup().await {
        Ok(()) => request.complete(),
        Err(reason) => request.fail(reason),
    }
}
