// =============================================================================
// Supervisor — boot sequence helpers, auto-resume, start/stop control
// =============================================================================
//
// Boot order: restore the state file, reconcile once against the venue, then
// decide whether to auto-resume. The engine resumes on its own only when the
// previous run was left running and its state file is younger than 24 hours;
// anything older requires an explicit start command.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::monitor::reconcile_once;
use crate::okx::OkxClient;
use crate::position::PositionMachine;

/// Maximum state-file age for auto-resume.
const AUTORESUME_MAX_AGE_H: i64 = 24;

/// Whether a restored machine qualifies for auto-resume.
pub fn should_autoresume(machine: &PositionMachine) -> bool {
    if !machine.is_running() {
        return false;
    }
    match machine.saved_at() {
        Some(saved_at) => {
            let age = Utc::now() - saved_at;
            let fresh = age < Duration::hours(AUTORESUME_MAX_AGE_H);
            if !fresh {
                info!(age_h = age.num_hours(), "saved state too old for auto-resume");
            }
            fresh
        }
        None => false,
    }
}

/// One boot-time reconciliation pass so the machine agrees with the venue
/// before any task starts making decisions.
pub async fn boot_reconcile(state: &Arc<AppState>, client: &Arc<OkxClient>) {
    info!("boot reconciliation");
    let now_ms = Utc::now().timestamp_millis();
    reconcile_once(state, client, now_ms).await;
}

/// Open the pipeline for decisions.
pub fn start(state: &AppState) {
    state.accepting.store(true, Ordering::Relaxed);
    state.machine.set_running(true);
    info!("engine started — accepting signals");
}

/// Stop deciding. The observation slot is dropped so nothing half-qualified
/// fires after the stop; a live long stays managed by the monitor.
pub fn stop(state: &AppState) {
    state.accepting.store(false, Ordering::Relaxed);
    state.machine.set_running(false);
    state.observation.clear();
    warn!("engine stopped — signals observed only");
}
