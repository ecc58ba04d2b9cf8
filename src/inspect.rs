//! The per-packet boundary between the kernel queue and the filter state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

use crate::conntrack::FilterState;
use crate::packet::{self, Decoded, PacketError};
use crate::queue::Verdict;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns raw queued packets into verdicts against the shared filter state.
#[derive(Clone)]
pub struct PacketInspector {
    state: Arc<Mutex<FilterState>>,
}

impl PacketInspector {
    pub fn new(state: Arc<Mutex<FilterState>>) -> Self {
        Self { state }
    }

    pub fn inspect(&self, data: &[u8]) -> Verdict {
        self.inspect_at(data, Instant::now())
    }

    /// Never panics and never fails: anything unexpected ends up as a
    /// conservative verdict.
    pub fn inspect_at(&self, data: &[u8], now: Instant) -> Verdict {
        let segment = match guarded(|| packet::decode(data)).and_then(|r| r) {
            Ok(Decoded::Tcp(segment)) => segment,
            Ok(Decoded::Other) => return Verdict::Accept,
            Err(e) => {
                debug!(len = data.len(), error = %e, "undecodable packet, dropping");
                return Verdict::Drop;
            }
        };

        let mut state = lock(&self.state);
        match guarded(|| state.classify(&segment, now)) {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!(tuple = %segment.tuple, error = %e, "packet inspection failed");
                state.fail_closed(&segment.tuple, now)
            }
        }
    }
}

fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, PacketError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        PacketError::Panicked(msg)
    })
}
