//! Restartable one-shot and interval timers.
//!
//! Each timer is a spawned task that selects between its clock and a stop
//! channel. A handle is created fresh every time a timer is armed and is
//! never re-armed; restarting means dropping the old handle and spawning a
//! new one. Callbacks that must not act after a stop should also check a
//! generation value they captured when armed, because a callback already
//! running when `stop()` is called finishes its current invocation.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Owner of a running timer task; stopping is idempotent and dropping stops.
#[derive(Debug)]
pub struct TimerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Stop the timer. Safe to call any number of times.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the timer may still fire.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `f` once after `delay` unless stopped first.
pub fn spawn_once<F>(runtime: &Handle, delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = runtime.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => f(),
            _ = &mut stop_rx => {}
        }
    });

    TimerHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}

/// Run `f` every `period`, first one full period from now, until stopped.
pub fn spawn_interval<F>(runtime: &Handle, period: Duration, mut f: F) -> TimerHandle
where
    F: FnMut() + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => f(),
                _ = &mut stop_rx => break,
            }
        }
    });

    TimerHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}
