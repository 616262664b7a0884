//! Periodic liveness announcements to the supervising process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::EngineManager;
use crate::events::{Event, EventBus};
use crate::status::Heartbeat;

/// A heartbeat that runs in a background task until stopped.
///
/// Reads the manager's published status, so it never waits on a load in
/// progress. Sends are best-effort: nobody listening is not an error.
pub struct HeartbeatHandle {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl HeartbeatHandle {
    /// Start beating every `period`, first beat immediately.
    pub fn start(manager: EngineManager, bus: Arc<EventBus>, period: Duration) -> Self {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_rx.changed() => break,
                }
                let beat = Heartbeat::from(&manager.status());
                if bus.emit(Event::Heartbeat(beat)) == 0 {
                    tracing::trace!("heartbeat had no listeners");
                }
            }
        });

        Self {
            handle,
            cancel: cancel_tx,
        }
    }

    /// Stop beating and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManagerConfig;
    use crate::runtime::mock::MockRuntime;

    fn manager(bus: &Arc<EventBus>) -> EngineManager {
        let runtime = Arc::new(MockRuntime::new(Vec::<String>::new()));
        EngineManager::new(
            runtime.clone(),
            runtime,
            Arc::clone(bus),
            None,
            ManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn beats_while_running() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let heart = HeartbeatHandle::start(manager(&bus), Arc::clone(&bus), Duration::from_millis(10));

        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Event::Heartbeat(beat) => {
                    assert!(beat.alive);
                    assert!(!beat.engine_ready);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        heart.stop().await;
    }

    #[tokio::test]
    async fn survives_without_listeners() {
        let bus = Arc::new(EventBus::default());
        let heart = HeartbeatHandle::start(manager(&bus), Arc::clone(&bus), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        heart.stop().await;
    }

    #[tokio::test]
    async fn immediate_stop() {
        let bus = Arc::new(EventBus::default());
        let heart = HeartbeatHandle::start(manager(&bus), Arc::clone(&bus), Duration::from_secs(60));
        heart.stop().await;
    }
}
