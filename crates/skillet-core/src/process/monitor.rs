//! Crash detection and restart
//!
//! Each monitor is tagged with the generation that was current when its
//! process started. A monitor whose tag no longer matches the backend's
//! generation has been superseded and exits without acting. A successful
//! restart bumps the generation and hands the new child to a new monitor
//! before the old one returns, so at most one monitor ever restarts a given
//! process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{self, ChildHandle};
use super::Shared;

/// Start watching `handle`'s child
pub(crate) fn spawn(
    shared: Arc<Shared>,
    handle: ChildHandle,
    generation: u64,
    stop: CancellationToken,
) {
    let guard = MonitorGuard::new(&shared);
    tokio::spawn(async move {
        let _guard = guard;
        watch(shared, handle, generation, stop).await;
    });
}

/// Counts live monitors
struct MonitorGuard(Arc<Shared>);

impl MonitorGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.monitors.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.monitors.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn watch(
    shared: Arc<Shared>,
    handle: ChildHandle,
    generation: u64,
    stop: CancellationToken,
) {
    let ChildHandle {
        mut child,
        kill,
        exited,
    } = handle;

    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the session is dropped
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let stopped = stop.is_cancelled();
    let current = shared.generation.load(Ordering::SeqCst);
    let _ = exited.send(());

    if stopped {
        debug!(skill = %shared.skill, generation, "Process stopped");
        return;
    }
    if current != generation {
        debug!(skill = %shared.skill, generation, current, "Superseded monitor exiting");
        return;
    }

    warn!(skill = %shared.skill, generation, status = ?status, "Skill process exited unexpectedly");
    restart(shared, generation, stop).await;
}

async fn restart(shared: Arc<Shared>, generation: u64, stop: CancellationToken) {
    let attempts = shared.config.max_restart_attempts;

    for attempt in 0..attempts {
        let delay = shared.config.backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.cancelled() => {
                debug!(skill = %shared.skill, "Restart aborted by stop");
                return;
            }
        }

        let mut inner = shared.inner.lock().await;
        if stop.is_cancelled() || shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        // Stale state from the dead process
        inner.session = None;
        let Some(launch) = inner.launch.clone() else {
            return;
        };

        let (mut session, handle) = match session::spawn(&launch) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(skill = %shared.skill, attempt = attempt + 1, "Respawn failed: {:#}", e);
                continue;
            }
        };

        if let Err(e) = shared.initialize(&mut session, &inner.identity).await {
            warn!(skill = %shared.skill, attempt = attempt + 1, "Re-initialize failed: {:#}", e);
            handle.reap().await;
            continue;
        }

        let next = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            skill = %shared.skill,
            attempt = attempt + 1,
            generation = next,
            pid = ?session.pid(),
            "Skill process restarted"
        );
        inner.session = Some(session);
        spawn(Arc::clone(&shared), handle, next, stop.clone());
        return;
    }

    error!(
        skill = %shared.skill,
        attempts,
        "Giving up restarting skill process; it stays detached until the next load"
    );
}
