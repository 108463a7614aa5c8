use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::scheduler::Scheduler;

/// Stop `scheduler` on the first SIGTERM or SIGINT.
///
/// The returned task completes once [`Scheduler::stop`] has returned: every
/// tracked action is stopped, the leader lock is released and the scheduler's
/// shutdown token (which the status API also watches) is cancelled.
pub fn stop_on_signal(scheduler: Scheduler) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    };
    Ok(tokio::spawn(stop_when(received, scheduler)))
}

/// Wait for `received` to name a signal, then tear the scheduler down.
async fn stop_when<F>(received: F, scheduler: Scheduler)
where
    F: Future<Output = &'static str>,
{
    let shutdown = scheduler.shutdown_token();
    tokio::select! {
        name = received => {
            tracing::info!(signal = name, "Received signal, stopping action scheduler");
        }
        // Stopped by other means; nothing left to tear down
        _ = shutdown.cancelled() => return,
    }
    scheduler.stop().await;
    tracing::info!("Action scheduler stopped");
}
