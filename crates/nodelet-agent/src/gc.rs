//! Periodic runtime garbage collection.

use std::sync::Arc;
use std::time::Duration;

use nodelet_runtime::{ContainerRuntime, GcTarget};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Ask the runtime to collect `target` every `period`, forever.
///
/// The first pass runs one full period after start. Failures are logged and
/// the next pass runs on schedule.
pub async fn run_garbage_collection(
    runtime: Arc<dyn ContainerRuntime>,
    target: GcTarget,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match runtime.garbage_collect(target).await {
            Ok(()) => debug!(gc = %target, "Garbage collection finished"),
            Err(e) => error!(gc = %target, error = %e, "Garbage collection failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelet_runtime::MemoryRuntime;

    #[tokio::test(start_paused = true)]
    async fn passes_run_each_period_and_survive_failures() {
        let runtime = Arc::new(MemoryRuntime::new());
        let handle = tokio::spawn(run_garbage_collection(
            runtime.clone(),
            GcTarget::Containers,
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runtime.gc_runs(GcTarget::Containers), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runtime.gc_runs(GcTarget::Containers), 1);

        runtime.fail_gc(Some("busy".to_string()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runtime.gc_runs(GcTarget::Containers), 1);

        runtime.fail_gc(None);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runtime.gc_runs(GcTarget::Containers), 2);
        assert_eq!(runtime.gc_runs(GcTarget::Images), 0);

        handle.abort();
    }
}
