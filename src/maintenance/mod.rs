use anyhow::{Context, Result};
use tokio::time::{Duration, sleep};
use tracing::{error, info};

use crate::web::{AppState, auth};

const CLEANUP_INTERVAL_MINUTES: u64 = 15;

pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(CLEANUP_INTERVAL_MINUTES * 60);
        loop {
            if let Err(err) = run_cleanup_cycle(&state).await {
                error!(?err, "session cleanup cycle failed");
            }
            sleep(interval).await;
        }
    });
}

async fn run_cleanup_cycle(state: &AppState) -> Result<()> {
    let sessions_removed = auth::purge_expired_sessions(state.pool_ref())
        .await
        .context("failed to purge expired sessions")?;

    if sessions_removed > 0 {
        let open_sockets = state.hub().connection_count().await;
        info!(sessions_removed, open_sockets, "session cleanup completed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::memory::MemoryStore;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn cleanup_cycle_can_run_on_a_spawned_task() {
        let state = AppState::for_tests(Arc::new(MemoryStore::default()));
        let cycle = run_cleanup_cycle(&state);
        assert_send(&cycle);
    }
}
