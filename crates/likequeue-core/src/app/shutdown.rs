//! Shutdown signal shared by the long-running loops.
//!
//! `true` on the watch channel means "stop". A dropped sender counts as stop too.

use std::time::Duration;

use tokio::sync::watch;

pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub fn is_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Sleep for `duration` unless shutdown comes first. Returns `true` on shutdown.
pub async fn sleep_or_shutdown(rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => is_requested(rx),
        changed = rx.changed() => changed.is_err() || is_requested(rx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (tx, mut rx) = channel();
        let sleeper = tokio::spawn(async move {
            sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await
        });

        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn plain_sleep_reports_no_shutdown() {
        let (_tx, mut rx) = channel();
        assert!(!sleep_or_shutdown(&mut rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn dropped_sender_means_stop() {
        let (tx, mut rx) = channel();
        drop(tx);
        assert!(sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await);
    }
}
