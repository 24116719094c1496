//! Observers notified around lifecycle transitions.
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{error, trace};

use crate::error::ListenerError;

/// Observer of start/stop transitions. Every method defaults to a no-op.
///
/// `graceful` is `true` for a requested stop and `false` for a forced kill.
pub trait LifecycleListener: Send + Sync {
    fn before_start(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn after_start(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn before_stop(&self, _graceful: bool) -> Result<(), ListenerError> {
        Ok(())
    }

    fn after_stop(&self, _graceful: bool) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Point in a transition at which listeners are notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionEvent {
    BeforeStart,
    AfterStart,
    BeforeStop { graceful: bool },
    AfterStop { graceful: bool },
}

impl TransitionEvent {
    fn dispatch(self, listener: &dyn LifecycleListener) -> Result<(), ListenerError> {
        match self {
            TransitionEvent::BeforeStart => listener.before_start(),
            TransitionEvent::AfterStart => listener.after_start(),
            TransitionEvent::BeforeStop { graceful } => listener.before_stop(graceful),
            TransitionEvent::AfterStop { graceful } => listener.after_stop(graceful),
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionEvent::BeforeStart => f.write_str("before_start"),
            TransitionEvent::AfterStart => f.write_str("after_start"),
            TransitionEvent::BeforeStop { graceful } => {
                write!(f, "before_stop(graceful={graceful})")
            }
            TransitionEvent::AfterStop { graceful } => {
                write!(f, "after_stop(graceful={graceful})")
            }
        }
    }
}

/// Handle returned by [`ListenerRegistry::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Entry = (ListenerId, Arc<dyn LifecycleListener>);

/// Insertion-ordered listener set that is safe to mutate while notifying.
///
/// Notification works on a snapshot taken under the lock, so listeners may
/// (un)register themselves or others from inside a callback.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    /// Returns `true` if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invokes `event` on every listener registered at the time of the call.
    ///
    /// A listener that returns an error or panics is logged and skipped; the
    /// rest of the snapshot is still notified and nothing propagates to the caller.
    pub fn notify(&self, event: TransitionEvent) {
        let snapshot: Vec<Entry> = self.lock().clone();
        trace!("Notifying {} listener(s) of {event}", snapshot.len());

        for (id, listener) in snapshot {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| event.dispatch(listener.as_ref())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("Listener {id:?} failed on {event}: {err}");
                }
                Err(payload) => {
                    error!(
                        "Listener {id:?} panicked on {event}: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
