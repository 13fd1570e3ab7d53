use crate::events::Event;
use crate::middleware::MiddlewareSystem;
use crate::types::Message;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// How many processed identities are remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 10_000;

/// Items with an identity can be recognised as duplicates.
pub trait QueueItem {
    fn identity(&self) -> Option<&str>;
}

impl QueueItem for Message {
    fn identity(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupePolicy {
    /// Only items already waiting in the queue are collapsed.
    Process,
    /// Items whose identity was processed recently are dropped as well.
    Skip,
}

struct QueueState<T> {
    items: VecDeque<T>,
    processing: bool,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

/// FIFO work queue drained by at most one processor at a time.
///
/// A caller that finds a drain already in progress returns immediately; the
/// active drain picks up whatever was enqueued meanwhile, so items are
/// handled strictly in arrival order.
pub struct ProcessQueue<T> {
    name: String,
    policy: DupePolicy,
    state: Mutex<QueueState<T>>,
    pub middleware: MiddlewareSystem<T>,
    pub emptied: Event<()>,
}

impl<T: QueueItem> ProcessQueue<T> {
    pub fn new(name: impl Into<String>, policy: DupePolicy) -> Self {
        let name = name.into();
        Self {
            middleware: MiddlewareSystem::new(format!("{}.middleware", name)),
            emptied: Event::new(format!("{}.emptied", name)),
            name,
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                processing: false,
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    /// Returns false when the item was recognised as a duplicate.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if let Some(id) = item.identity() {
            let queued = state.items.iter().any(|i| i.identity() == Some(id));
            let processed = self.policy == DupePolicy::Skip && state.seen.contains(id);
            if queued || processed {
                return false;
            }
        }
        state.items.push_back(item);
        true
    }

    pub fn enqueue_many(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.enqueue(item);
        }
    }

    /// Drain the queue through the middleware into `handler`.
    pub fn process<F>(&self, mut handler: F)
    where
        F: FnMut(T),
    {
        {
            let mut state = self.state.lock();
            if state.processing || state.items.is_empty() {
                return;
            }
            state.processing = true;
        }

        loop {
            let item = {
                let mut state = self.state.lock();
                let Some(item) = state.items.pop_front() else {
                    state.processing = false;
                    break;
                };
                if self.policy == DupePolicy::Skip
                    && let Some(id) = item.identity()
                {
                    let id = id.to_string();
                    if state.seen.insert(id.clone()) {
                        state.seen_order.push_back(id);
                    }
                    if state.seen_order.len() > SEEN_CAPACITY
                        && let Some(oldest) = state.seen_order.pop_front()
                    {
                        state.seen.remove(&oldest);
                    }
                }
                item
            };

            if let Some(item) = self.middleware.process(item, &()) {
                handler(item);
            }
        }

        self.emptied.trigger(&());
    }
}
