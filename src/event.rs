//! Typed publish/subscribe primitive.
//!
//! An [`Emitter`] owns listeners and fires values to them synchronously in
//! registration order. Its public face is an [`Event`]: a function from
//! listener to [`Disposable`]. Combinators (`once`, `filter`, `map`) wrap one
//! event into another.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::error;

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

type Hook = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by a subscription. Disposing is idempotent.
#[derive(Clone)]
pub struct Disposable {
    action: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Disposable {
    /// Wrap a teardown action.
    pub fn new<F: FnOnce() + Send + 'static>(action: F) -> Self {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    /// A disposable that does nothing.
    pub fn noop() -> Self {
        Self {
            action: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the teardown action. Later calls do nothing.
    pub fn dispose(&self) {
        let action = lock(&self.action).take();
        if let Some(action) = action {
            action();
        }
    }

    /// Whether the teardown action has already run.
    pub fn is_disposed(&self) -> bool {
        lock(&self.action).is_none()
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A subscribable source of `T` values.
pub struct Event<T> {
    subscribe: Arc<dyn Fn(Listener<T>) -> Disposable + Send + Sync>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: Arc::clone(&self.subscribe),
        }
    }
}

impl<T: 'static> Event<T> {
    /// Build an event from a subscribe function.
    pub fn new<F>(subscribe: F) -> Self
    where
        F: Fn(Listener<T>) -> Disposable + Send + Sync + 'static,
    {
        Self {
            subscribe: Arc::new(subscribe),
        }
    }

    /// An event that never fires.
    pub fn none() -> Self {
        Self::new(|_| Disposable::noop())
    }

    /// Register a listener.
    pub fn listen<F>(&self, listener: F) -> Disposable
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        (self.subscribe)(Arc::new(listener))
    }

    /// Register an already shared listener.
    pub fn listen_shared(&self, listener: Listener<T>) -> Disposable {
        (self.subscribe)(listener)
    }

    /// Fire at most once: the subscription is disposed before the listener runs.
    pub fn once(self) -> Event<T> {
        Event::new(move |listener: Listener<T>| {
            let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));
            let fired = Arc::new(AtomicBool::new(false));

            let subscription = {
                let slot = Arc::clone(&slot);
                let fired = Arc::clone(&fired);
                self.listen(move |value| {
                    if fired.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    if let Some(subscription) = lock(&slot).take() {
                        subscription.dispose();
                    }
                    listener(value);
                })
            };

            if fired.load(Ordering::SeqCst) {
                subscription.dispose();
            } else {
                *lock(&slot) = Some(subscription.clone());
            }
            subscription
        })
    }

    /// Only pass values matching the predicate.
    pub fn filter<P>(self, predicate: P) -> Event<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Event::new(move |listener: Listener<T>| {
            let predicate = Arc::clone(&predicate);
            self.listen(move |value| {
                if predicate(value) {
                    listener(value);
                }
            })
        })
    }

    /// Transform each value.
    pub fn map<O, M>(self, map: M) -> Event<O>
    where
        O: 'static,
        M: Fn(&T) -> O + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        Event::new(move |listener: Listener<O>| {
            let map = Arc::clone(&map);
            self.listen(move |value| listener(&map(value)))
        })
    }
}

/// Lifecycle hooks for an [`Emitter`].
#[derive(Clone, Default)]
pub struct EmitterOptions {
    on_first_listener_add: Option<Hook>,
    on_last_listener_remove: Option<Hook>,
}

impl EmitterOptions {
    /// Runs when the listener count goes from 0 to 1, after the listener is added.
    pub fn on_first_listener_add<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_first_listener_add = Some(Arc::new(hook));
        self
    }

    /// Runs when the listener count goes from 1 to 0.
    pub fn on_last_listener_remove<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_last_listener_remove = Some(Arc::new(hook));
        self
    }
}

struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
    disposed: bool,
}

struct EmitterInner<T> {
    listeners: Mutex<ListenerSet<T>>,
    options: EmitterOptions,
}

/// Owner side of an [`Event`].
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: 'static> Emitter<T> {
    /// Create an emitter with no hooks.
    pub fn new() -> Self {
        Self::with_options(EmitterOptions::default())
    }

    /// Create an emitter with lifecycle hooks.
    pub fn with_options(options: EmitterOptions) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(ListenerSet {
                    next_id: 0,
                    entries: Vec::new(),
                    disposed: false,
                }),
                options,
            }),
        }
    }

    /// The subscribable side of this emitter.
    pub fn event(&self) -> Event<T> {
        let weak = Arc::downgrade(&self.inner);
        Event::new(move |listener| match weak.upgrade() {
            Some(inner) => EmitterInner::add(&inner, listener),
            None => Disposable::noop(),
        })
    }

    /// Invoke every current listener with `value`.
    ///
    /// Listeners added or removed while firing take effect on the next fire.
    /// A panicking listener is logged and the remaining listeners still run.
    pub fn fire(&self, value: T) {
        let snapshot: Vec<Listener<T>> = {
            let set = lock(&self.inner.listeners);
            set.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(&value)));
            if let Err(payload) = outcome {
                error!("Event listener panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).entries.len()
    }

    /// Drop every listener. Later subscriptions are no-ops.
    pub fn dispose(&self) {
        let mut set = lock(&self.inner.listeners);
        set.entries.clear();
        set.disposed = true;
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EmitterInner<T> {
    fn add(inner: &Arc<Self>, listener: Listener<T>) -> Disposable {
        let (id, first) = {
            let mut set = lock(&inner.listeners);
            if set.disposed {
                return Disposable::noop();
            }
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, listener));
            (id, set.entries.len() == 1)
        };
        if first {
            if let Some(hook) = &inner.options.on_first_listener_add {
                hook();
            }
        }

        let weak: Weak<Self> = Arc::downgrade(inner);
        Disposable::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        })
    }

    fn remove(&self, id: u64) {
        let now_empty = {
            let mut set = lock(&self.listeners);
            if set.disposed {
                return;
            }
            let before = set.entries.len();
            set.entries.retain(|(entry_id, _)| *entry_id != id);
            before != set.entries.len() && set.entries.is_empty()
        };
        if now_empty {
            if let Some(hook) = &self.options.on_last_listener_remove {
                hook();
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
