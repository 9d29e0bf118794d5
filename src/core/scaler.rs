//! Runtime resizing and recycling of the worker set.

use tracing::{error, info};

use super::error::PoolError;
use super::maintainer::reconcile;
use super::pool::Shared;
use super::state::Lifecycle;
use crate::worker::{ProcessBackend, WorkerId};

/// Add `n` workers. While not running only the target size changes.
pub(crate) fn grow<B: ProcessBackend>(shared: &Shared<B>, n: usize) -> Result<(), PoolError> {
    let mut state = shared.state.lock();
    match state.lifecycle {
        Lifecycle::Terminated => return Err(PoolError::NotRunning(Lifecycle::Terminated)),
        Lifecycle::Init | Lifecycle::Closing => {
            state.target_size += n;
            info!(target = state.target_size, "pool target size raised");
            return Ok(());
        }
        Lifecycle::Running => {}
    }

    let mut outcome = Ok(());
    for _ in 0..n {
        match shared.spawn_worker(&mut state) {
            Ok(_) => state.target_size += 1,
            Err(e) => {
                error!(error = %e, "failed to grow pool");
                outcome = Err(e);
                break;
            }
        }
    }
    state.pump();
    shared.changed.notify_all();
    info!(target = state.target_size, live = state.live_count(), "pool grown");
    outcome
}

/// Remove `n` workers, idle ones first. Busy workers picked to go finish
/// their current task before exiting.
pub(crate) fn shrink<B: ProcessBackend>(shared: &Shared<B>, n: usize) -> Result<(), PoolError> {
    if n == 0 {
        return Ok(());
    }
    let mut state = shared.state.lock();
    if state.lifecycle == Lifecycle::Terminated {
        return Err(PoolError::NotRunning(Lifecycle::Terminated));
    }
    if n >= state.target_size {
        return Err(PoolError::InvalidResize {
            size: state.target_size,
            requested: n,
        });
    }
    state.target_size -= n;

    let excess = state.live_count().saturating_sub(state.target_size);
    let (idle, busy): (Vec<_>, Vec<_>) = state
        .workers
        .values()
        .filter(|w| w.is_live())
        .partition(|w| w.current.is_none());
    let victims: Vec<WorkerId> = idle
        .into_iter()
        .chain(busy)
        .map(|w| w.id)
        .take(excess)
        .collect();

    for id in &victims {
        if let Some(slot) = state.workers.get_mut(id) {
            slot.retire();
        }
    }
    shared.changed.notify_all();
    info!(target = state.target_size, retired = victims.len(), "pool shrunk");
    Ok(())
}

/// Replace every worker. Idle workers exit now, busy ones after their
/// current task; replacements are spawned immediately.
pub(crate) fn restart<B: ProcessBackend>(shared: &Shared<B>) -> Result<(), PoolError> {
    let mut state = shared.state.lock();
    if state.lifecycle != Lifecycle::Running {
        return Err(PoolError::NotRunning(state.lifecycle));
    }
    let old: Vec<WorkerId> = state
        .workers
        .values()
        .filter(|w| w.is_live())
        .map(|w| w.id)
        .collect();
    for id in &old {
        if let Some(slot) = state.workers.get_mut(id) {
            slot.retire();
        }
    }
    let spawned = reconcile(shared, &mut state)?;
    info!(retired = old.len(), spawned, "pool restarted");
    Ok(())
}
