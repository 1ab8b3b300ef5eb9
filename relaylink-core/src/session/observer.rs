use super::topics::topic_matches;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receives every message published on a subscribed filter.
///
/// Called synchronously from the session task: keep it short, hand heavy
/// work to a channel.
pub trait Observer: Send + Sync + 'static {
    fn on_message(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> Observer for F
where
    F: Fn(&str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        self(topic, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

struct Registration {
    id: SubscriptionId,
    filter: String,
    observer: Arc<dyn Observer>,
}

/// Observers of one session, in registration order
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    entries: Vec<Registration>,
    next_id: u64,
}

impl ObserverRegistry {
    pub fn has_filter(&self, filter: &str) -> bool {
        self.entries.iter().any(|r| r.filter == filter)
    }

    pub fn insert(&mut self, filter: String, observer: Arc<dyn Observer>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push(Registration { id, filter, observer });
        id
    }

    /// Removes one registration. Returns its filter and whether it was the
    /// last observer on that filter, `None` if the id is unknown.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        let pos = self.entries.iter().position(|r| r.id == id)?;
        let removed = self.entries.remove(pos);
        let last = !self.has_filter(&removed.filter);
        Some((removed.filter, last))
    }

    /// Distinct filters, first registration order
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for r in &self.entries {
            if !filters.contains(&r.filter) {
                filters.push(r.filter.clone());
            }
        }
        filters
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Invokes every matching observer once. A failing or panicking observer
    /// is logged and skipped. Returns how many observers accepted the message.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for r in self.entries.iter().filter(|r| topic_matches(&r.filter, topic)) {
            match catch_unwind(AssertUnwindSafe(|| r.observer.on_message(topic, payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("observer {:?} on '{}' failed: {:#}", r.id, r.filter, e),
                Err(_) => warn!("observer {:?} on '{}' panicked", r.id, r.filter),
            }
        }
        delivered
    }
}
