//! Polling change detector: the event producer used by the binary.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::Dispatcher;

/// Notify every source of `dispatcher` each `interval`. Each source task
/// compares the file against its own offset and identity, so a poke with
/// nothing new costs one `stat`. Abort the handle to stop polling.
pub fn spawn(dispatcher: Arc<Dispatcher>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            dispatcher.poke_all().await;
        }
    })
}
