use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::request::{CacheRequest, ObserverFn, Waiter};

/// What happens to an in-flight entry whose fetch reports a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The entry stays in flight. Callers arriving later queue behind a fetch that
    /// will never resolve; only `clear_all` releases the key.
    #[default]
    Stick,
    /// The entry is dropped so the next request for the key fetches again.
    Retry,
}

/// How a request was served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The key was ready; hooks ran synchronously.
    Hit,
    /// The key was in flight; the caller waits at `position` (1-based).
    Queued { position: usize },
    /// The key was empty; this request dispatched the fetch.
    Fetched,
}

/// Effect of one [`Completion::complete`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// First completion: the entry became ready and `waiters` callers were resolved.
    Resolved { waiters: usize },
    /// Push update on a ready entry.
    Updated { observed: bool },
    /// The entry this completion belonged to no longer exists.
    Stale,
}

/// Observable state of one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Empty,
    InFlight { waiting: usize },
    Ready { observed: bool },
}

enum EntryState<T, E> {
    InFlight {
        waitlist: VecDeque<Waiter<T, E>>,
    },
    Ready {
        value: T,
        observer: Option<ObserverFn<T>>,
    },
}

struct Entry<T, E> {
    /// Unique per created entry, so completions of a cleared entry can be told apart
    /// from a fresh entry under the same key.
    id: u64,
    state: EntryState<T, E>,
}

struct Table<T, E> {
    entries: HashMap<String, Entry<T, E>>,
    next_id: u64,
    policy: FailurePolicy,
}

/// Single-flight cache keyed by query string.
///
/// Cloning yields another handle to the same table. The coordinator is meant for a
/// single-threaded event loop: it is `!Send`, and no borrow of the table is held
/// while caller hooks run, so hooks may issue further requests.
pub struct CacheCoordinator<T, E = String> {
    inner: Rc<RefCell<Table<T, E>>>,
}

impl<T, E> Clone for CacheCoordinator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static, E: 'static> Default for CacheCoordinator<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static, E: 'static> CacheCoordinator<T, E> {
    pub fn new() -> Self {
        Self::with_policy(FailurePolicy::default())
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Table {
                entries: HashMap::new(),
                next_id: 0,
                policy,
            })),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.inner.borrow().policy
    }

    /// Serve a request: answer from cache, park it behind the in-flight fetch, or
    /// dispatch a new fetch. `fetch` runs at most once per entry lifetime.
    pub fn request(&self, request: CacheRequest<T, E>) -> Dispatch {
        let CacheRequest {
            key,
            fetch,
            on_start,
            mut waiter,
        } = request;

        if let Some(on_start) = on_start {
            on_start();
        }

        let mut table = self.inner.borrow_mut();
        match table.entries.get_mut(&key) {
            Some(Entry {
                state: EntryState::InFlight { waitlist },
                ..
            }) => {
                waitlist.push_back(waiter);
                let position = waitlist.len();
                debug!(key = %key, position, "queued behind in-flight fetch");
                Dispatch::Queued { position }
            }
            Some(Entry {
                id,
                state: EntryState::Ready { value, observer },
            }) => {
                let id = *id;
                waiter.take_observer_rule().apply(observer);
                let value = value.clone();
                drop(table);
                debug!(key = %key, entry = id, "cache hit");
                waiter.finish(&value);
                Dispatch::Hit
            }
            None => {
                let id = table.next_id;
                table.next_id += 1;
                let mut waitlist = VecDeque::new();
                waitlist.push_back(waiter);
                table.entries.insert(
                    key.clone(),
                    Entry {
                        id,
                        state: EntryState::InFlight { waitlist },
                    },
                );
                drop(table);

                debug!(key = %key, entry = id, "dispatching fetch");
                fetch(Completion {
                    table: Rc::downgrade(&self.inner),
                    key,
                    id,
                });
                Dispatch::Fetched
            }
        }
    }

    /// Drop every entry. Parked callers of in-flight entries are discarded without
    /// being called, and completions of fetches dispatched before the clear become
    /// stale. Transport subscriptions are not touched.
    pub fn clear_all(&self) {
        let dropped = std::mem::take(&mut self.inner.borrow_mut().entries);
        debug!(entries = dropped.len(), "cache cleared");
        // Waiter closures are dropped outside of the table borrow.
        drop(dropped);
    }

    pub fn status(&self, key: &str) -> EntryStatus {
        match self.inner.borrow().entries.get(key).map(|entry| &entry.state) {
            None => EntryStatus::Empty,
            Some(EntryState::InFlight { waitlist }) => EntryStatus::InFlight {
                waiting: waitlist.len(),
            },
            Some(EntryState::Ready { observer, .. }) => EntryStatus::Ready {
                observed: observer.is_some(),
            },
        }
    }

    /// Last known value of a ready key.
    pub fn value(&self, key: &str) -> Option<T> {
        match self.inner.borrow().entries.get(key).map(|entry| &entry.state) {
            Some(EntryState::Ready { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}

/// Handle given to a fetch. The first [`complete`](Self::complete) resolves the
/// entry; every later call is a push update.
pub struct Completion<T, E = String> {
    table: Weak<RefCell<Table<T, E>>>,
    key: String,
    id: u64,
}

impl<T, E> Clone for Completion<T, E> {
    fn clone(&self) -> Self {
        Self {
            table: Weak::clone(&self.table),
            key: self.key.clone(),
            id: self.id,
        }
    }
}

impl<T: Clone + 'static, E: 'static> Completion<T, E> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store `value` for the key. Resolves parked callers in arrival order on the
    /// first call, notifies the registered observer on every later call.
    pub fn complete(&self, value: T) -> Delivery {
        let Some(table) = self.table.upgrade() else {
            debug!(key = %self.key, "completion after coordinator was dropped");
            return Delivery::Stale;
        };

        let mut guard = table.borrow_mut();
        let Some(entry) = guard
            .entries
            .get_mut(&self.key)
            .filter(|entry| entry.id == self.id)
        else {
            debug!(key = %self.key, entry = self.id, "discarding completion of cleared entry");
            return Delivery::Stale;
        };

        match &mut entry.state {
            EntryState::InFlight { waitlist } => {
                let waiters = std::mem::take(waitlist);
                entry.state = EntryState::Ready {
                    value: value.clone(),
                    observer: None,
                };
                drop(guard);

                let count = waiters.len();
                debug!(key = %self.key, waiters = count, "fetch resolved");
                for waiter in waiters {
                    settle(&table, &self.key, self.id, waiter, &value);
                }
                Delivery::Resolved { waiters: count }
            }
            EntryState::Ready {
                value: current,
                observer,
            } => {
                *current = value.clone();
                let observer = observer.clone();
                drop(guard);

                debug!(key = %self.key, observed = observer.is_some(), "push update");
                match observer {
                    Some(observer) => {
                        observer(&value);
                        Delivery::Updated { observed: true }
                    }
                    None => Delivery::Updated { observed: false },
                }
            }
        }
    }

    /// Report that the fetch failed. Parked callers get `error` in arrival order;
    /// what happens to the entry depends on the coordinator's [`FailurePolicy`].
    ///
    /// Returns `false` when the entry was already ready or cleared, in which case the
    /// error belongs to whoever owns the fetch.
    pub fn fail(&self, error: E) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };

        let mut guard = table.borrow_mut();
        let policy = guard.policy;
        let waiters = match guard
            .entries
            .get_mut(&self.key)
            .filter(|entry| entry.id == self.id)
            .map(|entry| &mut entry.state)
        {
            Some(EntryState::InFlight { waitlist }) => std::mem::take(waitlist),
            Some(EntryState::Ready { .. }) => {
                debug!(key = %self.key, "failure reported after resolution");
                return false;
            }
            None => return false,
        };

        match policy {
            FailurePolicy::Stick => {
                warn!(key = %self.key, waiters = waiters.len(), "fetch failed; entry stays in flight");
            }
            FailurePolicy::Retry => {
                guard.entries.remove(&self.key);
                warn!(key = %self.key, waiters = waiters.len(), "fetch failed; entry released for retry");
            }
        }
        drop(guard);

        for waiter in waiters {
            waiter.fail(&error);
        }
        true
    }
}

/// Resolve one parked caller after its entry became ready.
///
/// The observer rule is applied to the entry if it is still the same entry; a hook
/// that cleared the cache mid-drain leaves later callers with the fetched value.
fn settle<T: Clone, E>(
    table: &RefCell<Table<T, E>>,
    key: &str,
    id: u64,
    mut waiter: Waiter<T, E>,
    fetched: &T,
) {
    let rule = waiter.take_observer_rule();
    let current = {
        let mut table = table.borrow_mut();
        match table
            .entries
            .get_mut(key)
            .filter(|entry| entry.id == id)
            .map(|entry| &mut entry.state)
        {
            Some(EntryState::Ready { value, observer }) => {
                rule.apply(observer);
                Some(value.clone())
            }
            _ => None,
        }
    };

    match current {
        Some(value) => waiter.finish(&value),
        None => waiter.finish(fetched),
    }
}
