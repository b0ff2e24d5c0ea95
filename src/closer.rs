use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Single-shot stop control for one background task.
///
/// The owner signals stop exactly once; the task observes the signal at its
/// next loop iteration, drains any residual channel deterministically, and
/// acknowledges by terminating. Signalling never interrupts an in-flight
/// operation.
pub struct Closer {
    tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Receiving half of a [`Closer`], handed to the task it controls.
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Completes once stop has been signalled.
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow() {
            // A closed channel means the owner is gone, which also means stop.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Closer {
    /// Creates the signal pair for a task about to be spawned.
    pub fn signal() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal { rx })
    }

    /// Binds the sending half to the spawned task's handle.
    pub fn new(tx: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { tx, handle }
    }

    /// Signals stop and waits for the task to acknowledge by terminating.
    pub async fn signal_and_wait(self) -> Result<()> {
        let _ = self.tx.send(true);
        self.handle.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_and_wait_stops_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, mut signal) = Closer::signal();
        let task_counter = counter.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task_counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = signal.stopped() => break,
                }
            }
        });
        let closer = Closer::new(tx, handle);

        tokio::time::sleep(Duration::from_millis(30)).await;
        closer.signal_and_wait().await.expect("task join failed");

        let stopped_at = counter.load(Ordering::SeqCst);
        assert!(stopped_at > 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_stop_signal_observed_once_set() {
        let (tx, mut signal) = Closer::signal();
        assert!(!signal.is_stopped());
        tx.send(true).unwrap();
        assert!(signal.is_stopped());
        // Completes immediately rather than hanging.
        signal.stopped().await;
    }
}
