//! Caller side of a cache request: the fetch closure plus the hooks that run
//! once the key resolves.

use std::rc::Rc;

use super::coordinator::Completion;

/// Callback invoked on every push update of a ready key.
pub type ObserverFn<T> = Rc<dyn Fn(&T)>;

pub(crate) type FetchFn<T, E> = Box<dyn FnOnce(Completion<T, E>)>;
pub(crate) type Hook = Box<dyn FnOnce()>;

/// What a request does with the observer slot of its key once it resolves.
pub enum Observe<T> {
    /// Leave whatever observer is registered untouched.
    Keep,
    /// Remove the registered observer.
    Clear,
    /// Replace the registered observer.
    Notify(ObserverFn<T>),
}

impl<T> Observe<T> {
    pub fn notify(observer: impl Fn(&T) + 'static) -> Self {
        Observe::Notify(Rc::new(observer))
    }

    /// Apply this rule to an observer slot. Last registration wins.
    pub(crate) fn apply(self, slot: &mut Option<ObserverFn<T>>) {
        match self {
            Observe::Keep => {}
            Observe::Clear => *slot = None,
            Observe::Notify(observer) => *slot = Some(observer),
        }
    }
}

impl<T> Default for Observe<T> {
    fn default() -> Self {
        Observe::Keep
    }
}

/// A parked caller: everything that has to happen once its key is ready.
pub(crate) struct Waiter<T, E> {
    pub(crate) observe: Observe<T>,
    pub(crate) on_ready: Option<Box<dyn FnOnce(&T)>>,
    pub(crate) on_complete: Option<Hook>,
    pub(crate) on_error: Option<Box<dyn FnOnce(&E)>>,
}

impl<T, E> Waiter<T, E> {
    pub(crate) fn take_observer_rule(&mut self) -> Observe<T> {
        std::mem::take(&mut self.observe)
    }

    /// Run the ready hooks. No borrow of the cache table may be held here.
    pub(crate) fn finish(self, value: &T) {
        if let Some(on_ready) = self.on_ready {
            on_ready(value);
        }
        if let Some(on_complete) = self.on_complete {
            on_complete();
        }
    }

    pub(crate) fn fail(self, error: &E) {
        if let Some(on_error) = self.on_error {
            on_error(error);
        }
    }
}

/// Builder for [`CacheCoordinator::request`](super::CacheCoordinator::request).
///
/// ```
/// use sensorchart::cache::{CacheCoordinator, CacheRequest};
///
/// let cache: CacheCoordinator<u32> = CacheCoordinator::new();
/// cache.request(
///     CacheRequest::new("answer", |completion| {
///         completion.complete(42);
///     })
///     .on_ready(|value| assert_eq!(*value, 42)),
/// );
/// ```
pub struct CacheRequest<T, E = String> {
    pub(crate) key: String,
    pub(crate) fetch: FetchFn<T, E>,
    pub(crate) on_start: Option<Hook>,
    pub(crate) waiter: Waiter<T, E>,
}

impl<T, E> CacheRequest<T, E> {
    pub fn new(key: impl Into<String>, fetch: impl FnOnce(Completion<T, E>) + 'static) -> Self {
        Self {
            key: key.into(),
            fetch: Box::new(fetch),
            on_start: None,
            waiter: Waiter {
                observe: Observe::Keep,
                on_ready: None,
                on_complete: None,
                on_error: None,
            },
        }
    }

    /// Called exactly once with the current or eventually resolved value.
    pub fn on_ready(mut self, on_ready: impl FnOnce(&T) + 'static) -> Self {
        self.waiter.on_ready = Some(Box::new(on_ready));
        self
    }

    /// Observer rule applied when this request resolves. Defaults to [`Observe::Keep`].
    pub fn observe(mut self, observe: Observe<T>) -> Self {
        self.waiter.observe = observe;
        self
    }

    /// Runs before the coordinator looks at the key.
    pub fn on_start(mut self, on_start: impl FnOnce() + 'static) -> Self {
        self.on_start = Some(Box::new(on_start));
        self
    }

    /// Runs right after `on_ready`; does not wait for observer calls.
    pub fn on_complete(mut self, on_complete: impl FnOnce() + 'static) -> Self {
        self.waiter.on_complete = Some(Box::new(on_complete));
        self
    }

    /// Runs if the fetch this request is waiting on fails before resolving.
    pub fn on_error(mut self, on_error: impl FnOnce(&E) + 'static) -> Self {
        self.waiter.on_error = Some(Box::new(on_error));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
