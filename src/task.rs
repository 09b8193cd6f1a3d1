// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Task spawning, periodic workers and coordinated shutdown.
//!
//! Shutdown is a single broadcast flag: one [`ShutdownNotifier`] raises it,
//! and every [`ShutdownListener`] clone (accept loops, session loops,
//! periodic workers) observes it independently.

use tokio::sync::watch;

use std::{future::Future, time::Duration};

/// A long-running component driven by its own task until shutdown.
#[async_trait::async_trait]
pub(crate) trait Runnable {
    const NAME: &'static str;

    async fn run(self, shutdown: ShutdownListener);
}

/// A unit of periodic work driven by [`repeat`].
#[async_trait::async_trait]
pub(crate) trait RepeatedTask: Send + Sync + 'static {
    const NAME: &'static str;

    async fn tick(&self);
}

pub(crate) fn spawn_runnable<R>(runnable: R, shutdown: ShutdownListener)
where
    R: Runnable + Send + 'static,
{
    log::debug!("Starting `{}`.", R::NAME);

    tokio::spawn(runnable.run(shutdown));
}

/// Spawns a task that is not tied to the shutdown signal; it ends on its
/// own or with the runtime.
pub(crate) fn spawn_detached<F>(task_name: &str, fut: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    log::trace!("Detaching `{}` task.", task_name);

    tokio::spawn(fut);
}

/// Drives `task.tick()` after each delay the iterator yields, until the
/// shutdown fires or the iterator runs dry. Errors are the tick's concern;
/// one failed iteration never stops the schedule.
pub(crate) fn repeat<T, D>(task: T, mut delay: D, mut shutdown: ShutdownListener)
where
    T: RepeatedTask,
    D: Iterator<Item = Duration> + Send + 'static,
{
    log::debug!("Starting `{}` on its own schedule.", T::NAME);

    tokio::spawn(async move {
        while let Some(period) = delay.next() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(period) => task.tick().await,
            }
        }

        log::debug!("`{}` finished.", T::NAME);
    });
}

/// Creates the shutdown signal pair.
pub(crate) fn shutdown_chan() -> (ShutdownNotifier, ShutdownListener) {
    let (tx, rx) = watch::channel(false);

    (ShutdownNotifier(tx), ShutdownListener(rx))
}

pub(crate) struct ShutdownNotifier(watch::Sender<bool>);

impl ShutdownNotifier {
    /// Raises the shutdown flag for every listener, including ones cloned
    /// afterwards.
    pub(crate) fn notify(self) {
        // Listeners treat a dropped notifier as shutdown as well, so the
        // send result carries no information.
        let _ = self.0.send(true);
    }
}

/// A cheaply cloneable handle that resolves once shutdown was signalled.
#[derive(Clone)]
pub(crate) struct ShutdownListener(watch::Receiver<bool>);

impl ShutdownListener {
    pub(crate) async fn recv(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                break;
            }
        }
    }
}
