//! Cooperative stop signal shared by the scheduler, the writer and the exporter

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger(Arc::new(tx)), StopSignal(rx))
}

#[derive(Clone, Debug)]
pub struct StopTrigger(Arc<watch::Sender<bool>>);

impl StopTrigger {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal(self.0.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once stop is requested. Never resolves if every trigger is dropped first.
    pub async fn stopped(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `pause`; returns `true` if stop was requested first.
    pub async fn sleep_or_stop(&self, pause: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(pause) => self.is_stopped(),
            _ = self.stopped() => true,
        }
    }
}
