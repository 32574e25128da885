//! Transfer progress reporting
//!
//! [`ProgressTracker`] owns the byte counter of one transfer and decides when
//! a [`ProgressListener`] gets to hear about it. It knows nothing about I/O,
//! the pumping loops in the API crate feed it chunk sizes.

use std::fmt;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};

/// Default minimum byte delta between two progress notifications.
pub const DEFAULT_PROGRESS_THRESHOLD: u64 = 8 * 1024;

/// Receives `(bytes_transferred, total_bytes)` updates for a single transfer.
///
/// `total` is `None` when the payload length is not known up front.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, transferred: u64, total: Option<u64>);
}

impl<F> ProgressListener for F
where
    F: Fn(u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, transferred: u64, total: Option<u64>) {
        self(transferred, total)
    }
}

/// Throttled byte counter for one transfer
pub struct ProgressTracker {
    listener: Option<Arc<dyn ProgressListener>>,
    threshold: u64,
    total: Option<u64>,
    transferred: u64,
    last_reported: Option<u64>,
    finished: bool,
}

impl ProgressTracker {
    pub fn new(
        listener: Option<Arc<dyn ProgressListener>>,
        threshold: u64,
        total: Option<u64>,
    ) -> Self {
        Self {
            listener,
            threshold: threshold.max(1),
            total,
            transferred: 0,
            last_reported: None,
            finished: false,
        }
    }

    /// Counter only, nobody listening.
    pub fn silent(total: Option<u64>) -> Self {
        Self::new(None, DEFAULT_PROGRESS_THRESHOLD, total)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Record `bytes` more moved. Going past the declared total is an
    /// integrity error and is never reported to the listener.
    pub fn advance(&mut self, bytes: u64) -> ApiResult<()> {
        let next = self.transferred.saturating_add(bytes);
        if let Some(total) = self.total {
            if next > total {
                return Err(ApiError::Integrity {
                    expected: total,
                    actual: next,
                });
            }
        }
        self.transferred = next;

        if let Some(listener) = &self.listener {
            let since = next - self.last_reported.unwrap_or(0);
            if since >= self.threshold {
                self.last_reported = Some(next);
                listener.on_progress(next, self.total);
            }
        }
        Ok(())
    }

    /// Close the transfer: checks the declared length and emits the final
    /// count if it has not been reported yet. Returns the byte count.
    pub fn finish(&mut self) -> ApiResult<u64> {
        if let Some(total) = self.total {
            if self.transferred != total {
                return Err(ApiError::Integrity {
                    expected: total,
                    actual: self.transferred,
                });
            }
        }

        if !self.finished {
            self.finished = true;
            if let Some(listener) = &self.listener {
                if self.last_reported != Some(self.transferred) {
                    self.last_reported = Some(self.transferred);
                    listener.on_progress(self.transferred, self.total);
                }
            }
        }
        Ok(self.transferred)
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("listening", &self.listener.is_some())
            .field("threshold", &self.threshold)
            .field("total", &self.total)
            .field("transferred", &self.transferred)
            .finish()
    }
}
