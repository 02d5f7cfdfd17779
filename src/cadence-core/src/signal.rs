//! In-process signals.
//!
//! A [`Signal`] is a named channel holding an ordered list of slots. Emission
//! is synchronous: every live slot is called on the emitting thread, in the
//! order it was connected, before `emit` returns.
//!
//! Slots come in three flavours:
//! - strong slots, kept alive by the signal until disconnected;
//! - weak slots, bound to an owner held through a [`Weak`] reference and
//!   pruned on the first emission after the owner is dropped;
//! - async slots, whose future is spawned on the runtime installed in an
//!   [`AsyncHook`].
//!
//! Emission works on a snapshot of the slot list, so slots may connect or
//! disconnect (themselves included) from inside a callback. A slot connected
//! during an emission is first called by the next one; a slot disconnected
//! during an emission is not called again, even by the emission in flight.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::runtime::Handle;

/// Error type returned by failing slots.
pub type SlotError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by every slot.
pub type SlotResult = Result<(), SlotError>;

type Callback<T> = Arc<dyn Fn(&T) -> SlotResult + Send + Sync>;

/// Identifier of a connected slot, unique within its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

/// A slot failed while a signal was being emitted.
#[derive(Debug, Error)]
#[error("slot {slot:?} of signal '{signal}' failed: {source}")]
pub struct SignalError {
    pub signal: &'static str,
    pub slot: SlotId,
    #[source]
    pub source: SlotError,
}

enum Lifetime {
    Strong,
    Weak(Box<dyn Fn() -> bool + Send + Sync>),
}

struct Slot<T> {
    id: SlotId,
    callback: Callback<T>,
    lifetime: Lifetime,
    connected: Arc<AtomicBool>,
}

impl<T> Slot<T> {
    fn is_alive(&self) -> bool {
        match &self.lifetime {
            Lifetime::Strong => true,
            Lifetime::Weak(owner_alive) => owner_alive(),
        }
    }
}

struct Snapshot<T> {
    id: SlotId,
    callback: Callback<T>,
    connected: Arc<AtomicBool>,
}

pub struct Signal<T> {
    name: &'static str,
    slots: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("slots", &self.lock_slots().len())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Connect a slot that stays connected until [`Signal::disconnect`].
    pub fn connect<F>(&self, callback: F) -> SlotId
    where
        F: Fn(&T) -> SlotResult + Send + Sync + 'static,
    {
        self.insert(Arc::new(callback), Lifetime::Strong)
    }

    /// Connect a slot bound to `owner` without keeping the owner alive.
    ///
    /// Once every strong reference to `owner` is gone the slot is skipped and
    /// removed on the next emission.
    pub fn connect_weak<O, F>(&self, owner: &Arc<O>, callback: F) -> SlotId
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &T) -> SlotResult + Send + Sync + 'static,
    {
        let target: Weak<O> = Arc::downgrade(owner);
        let watched = target.clone();
        self.insert(
            Arc::new(move |payload: &T| match target.upgrade() {
                Some(owner) => callback(&owner, payload),
                None => Ok(()),
            }),
            Lifetime::Weak(Box::new(move || watched.strong_count() > 0)),
        )
    }

    /// Connect a slot whose work runs as a task on the hook's runtime.
    ///
    /// The callback builds the future synchronously during emission; it must
    /// clone whatever it needs out of the payload.
    pub fn connect_async<F>(&self, hook: &AsyncHook, callback: F) -> SlotId
    where
        F: Fn(&T) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let hook = hook.clone();
        let name = self.name;
        self.connect(move |payload| {
            if !hook.spawn(callback(payload)) {
                tracing::debug!(signal = name, "async support is down; skipping async slot");
            }
            Ok(())
        })
    }

    /// Async slot bound to `owner`, pruned like [`Signal::connect_weak`].
    ///
    /// The callback gets the upgraded owner so the future can keep a weak
    /// handle to it.
    pub fn connect_weak_async<O, F>(
        &self,
        hook: &AsyncHook,
        owner: &Arc<O>,
        callback: F,
    ) -> SlotId
    where
        O: Send + Sync + 'static,
        F: Fn(&Arc<O>, &T) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let target: Weak<O> = Arc::downgrade(owner);
        let watched = target.clone();
        let hook = hook.clone();
        let name = self.name;
        self.insert(
            Arc::new(move |payload: &T| {
                let Some(owner) = target.upgrade() else {
                    return Ok(());
                };
                if !hook.spawn(callback(&owner, payload)) {
                    tracing::debug!(signal = name, "async support is down; skipping async slot");
                }
                Ok(())
            }),
            Lifetime::Weak(Box::new(move || watched.strong_count() > 0)),
        )
    }

    /// Remove a slot. Returns `false` when it was not connected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.lock_slots();
        match slots.iter().position(|slot| slot.id == id) {
            Some(index) => {
                let slot = slots.remove(index);
                slot.connected.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        for slot in self.lock_slots().drain(..) {
            slot.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.lock_slots().iter().filter(|slot| slot.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every live slot in order, stopping at the first failure.
    pub fn emit(&self, payload: &T) -> Result<(), SignalError> {
        for slot in self.snapshot() {
            if !slot.connected.load(Ordering::SeqCst) {
                continue;
            }
            (slot.callback)(payload).map_err(|source| SignalError {
                signal: self.name,
                slot: slot.id,
                source,
            })?;
        }
        Ok(())
    }

    /// Call every live slot in order, collecting failures instead of stopping.
    pub fn emit_all(&self, payload: &T) -> Vec<SignalError> {
        let mut failures = Vec::new();
        for slot in self.snapshot() {
            if !slot.connected.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(source) = (slot.callback)(payload) {
                failures.push(SignalError {
                    signal: self.name,
                    slot: slot.id,
                    source,
                });
            }
        }
        failures
    }

    fn insert(&self, callback: Callback<T>, lifetime: Lifetime) -> SlotId {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_slots().push(Slot {
            id,
            callback,
            lifetime,
            connected: Arc::new(AtomicBool::new(true)),
        });
        id
    }

    fn snapshot(&self) -> Vec<Snapshot<T>> {
        let mut slots = self.lock_slots();
        slots.retain(|slot| {
            let alive = slot.is_alive();
            if !alive {
                slot.connected.store(false, Ordering::SeqCst);
                tracing::trace!(signal = self.name, slot = ?slot.id, "pruned dead weak slot");
            }
            alive
        });
        slots
            .iter()
            .map(|slot| Snapshot {
                id: slot.id,
                callback: Arc::clone(&slot.callback),
                connected: Arc::clone(&slot.connected),
            })
            .collect()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runtime hook used by async slots.
///
/// The orchestrator installs the runtime handle when the loop starts and tears
/// it down during shutdown; async slots emitted while no handle is installed
/// are skipped.
#[derive(Clone, Default)]
pub struct AsyncHook {
    handle: Arc<RwLock<Option<Handle>>>,
}

impl fmt::Debug for AsyncHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHook")
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl AsyncHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, handle: Handle) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Remove the runtime handle. Returns whether one was installed.
    pub fn teardown(&self) -> bool {
        self.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn `future` on the installed runtime. Returns `false` if none is.
    pub fn spawn(&self, future: BoxFuture<'static, ()>) -> bool {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handle) => {
                handle.spawn(future);
                true
            }
            None => false,
        }
    }
}
