//! Cooperative abort signalling.
//!
//! Each executing build owns one sender; every step task holds a receiver
//! and races its work against [`aborted`]. The signal is sticky: once sent,
//! late subscribers observe it immediately.

use tokio::sync::watch;

pub type AbortSender = watch::Sender<bool>;
pub type AbortReceiver = watch::Receiver<bool>;

pub fn channel() -> (AbortSender, AbortReceiver) {
    watch::channel(false)
}

/// A receiver that never fires, for callers with nothing to cancel them.
pub fn never() -> AbortReceiver {
    static SENDER: std::sync::OnceLock<AbortSender> = std::sync::OnceLock::new();
    SENDER.get_or_init(|| watch::channel(false).0).subscribe()
}

/// Resolves once the abort signal has been raised.
///
/// If the sender is gone without the signal having been raised, this pends
/// forever: the select arm racing against it simply never wins.
pub async fn aborted(rx: &mut AbortReceiver) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
