//! Process-wide backend lifetime.
//!
//! Each backend type is initialized when its first session becomes live and
//! torn down when its last session is dropped.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::InferenceBackend;

static LIVE_SESSIONS: Mutex<BTreeMap<TypeId, usize>> = Mutex::new(BTreeMap::new());

/// Number of live sessions holding the runtime of backend type `B`.
pub fn active_sessions<B: InferenceBackend>() -> usize {
    LIVE_SESSIONS
        .lock()
        .get(&TypeId::of::<B>())
        .copied()
        .unwrap_or(0)
}

/// A session's share of the process-wide runtime for `B`.
pub(crate) struct RuntimeLease<B: InferenceBackend> {
    backend: Arc<B>,
}

impl<B: InferenceBackend> RuntimeLease<B> {
    pub(crate) fn acquire(backend: Arc<B>) -> Self {
        let mut live = LIVE_SESSIONS.lock();
        let count = live.entry(TypeId::of::<B>()).or_insert(0);
        if *count == 0 {
            backend.init_process();
            info!(backend = B::NAME, "Backend initialized");
        }
        *count += 1;
        Self { backend }
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: InferenceBackend> Drop for RuntimeLease<B> {
    fn drop(&mut self) {
        let mut live = LIVE_SESSIONS.lock();
        let id = TypeId::of::<B>();
        let remaining = match live.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            live.remove(&id);
            self.backend.free_process();
            info!(backend = B::NAME, "Backend freed");
        }
    }
}
