//! Async logging utility for hot paths.
//!
//! Price ticks and transaction routing must never block on a log write, so
//! messages go through a bounded channel to a background task. A full
//! channel drops the line and counts it; the drop count is surfaced with the
//! next line that gets through.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::sync::mpsc::{self, error::TrySendError, Sender};

/// Channel capacity. When full, lines are dropped rather than blocking.
const CHANNEL_CAPACITY: usize = 1024;

static LOG_SENDER: OnceLock<Sender<String>> = OnceLock::new();
static DROPPED: AtomicU64 = AtomicU64::new(0);

/// Initialize the async logger. Call once at startup.
/// Returns a handle to the background logging task.
pub fn init_async_logger() -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    LOG_SENDER
        .set(tx)
        .expect("async logger already initialized");

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let dropped = DROPPED.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                info!("({dropped} log lines dropped under load)");
            }
            info!("{}", msg);
        }
    })
}

/// Log a message asynchronously. Non-blocking.
#[inline]
pub fn info_async(msg: String) {
    if let Some(sender) = LOG_SENDER.get() {
        if let Err(TrySendError::Full(_)) = sender.try_send(msg) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Convenience macro for async info logging with format support
#[macro_export]
macro_rules! info_async {
    ($($arg:tt)*) => {
        $crate::async_log::info_async(format!($($arg)*))
    };
}
