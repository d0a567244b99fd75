//! Subscription index
//!
//! Three tiers keyed by filter shape: an exact-match multimap for plain
//! filters, a list of wildcard filters matched level by level, and a list of
//! `#` (omni) filters that match every non-`$` topic. Matching a published
//! topic walks the tiers in that order.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::broker::ConnectionId;
use crate::protocol::QoS;
use crate::topic::{filter_matches, split_levels, FilterKind};

/// Who receives matched publishes: a connection (by stable id, resolved
/// against the client registry under the state lock) or a named script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscriber {
    Connection(ConnectionId),
    Script(String),
}

/// One subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscriber: Subscriber,
    /// The filter as received
    pub filter: String,
    /// Filter levels, populated only for the wildcard tier
    pub levels: Vec<String>,
    /// Granted maximum QoS; always `Some` for connections, optional for
    /// scripts (scripts receive at the published QoS)
    pub qos: Option<QoS>,
}

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    simple: AHashMap<String, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
    omni: Vec<Subscription>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription. A second subscribe by the same subscriber to
    /// the same filter replaces the first (updating the granted QoS).
    pub fn insert(&mut self, subscriber: Subscriber, filter: String, qos: Option<QoS>) {
        let kind = FilterKind::classify(&filter);

        let entry = Subscription {
            subscriber,
            levels: match kind {
                FilterKind::Simple => Vec::new(),
                FilterKind::Wildcard | FilterKind::Omni => split_levels(&filter),
            },
            filter,
            qos,
        };

        match kind {
            FilterKind::Simple => {
                let subs = self.simple.entry(entry.filter.clone()).or_default();
                subs.retain(|s| s.subscriber != entry.subscriber);
                subs.push(entry);
            }
            FilterKind::Wildcard => {
                self.wildcard
                    .retain(|s| !(s.subscriber == entry.subscriber && s.filter == entry.filter));
                self.wildcard.push(entry);
            }
            FilterKind::Omni => {
                self.omni.retain(|s| s.subscriber != entry.subscriber);
                self.omni.push(entry);
            }
        }
    }

    /// Remove one (subscriber, filter) pair. The exact tier is checked
    /// first; failing that, the wildcard and omni lists are scanned.
    pub fn remove(&mut self, subscriber: &Subscriber, filter: &str) {
        if let Some(subs) = self.simple.get_mut(filter) {
            let before = subs.len();
            subs.retain(|s| s.subscriber != *subscriber);
            let removed = subs.len() != before;
            if subs.is_empty() {
                self.simple.remove(filter);
            }
            if removed {
                return;
            }
        }

        self.wildcard
            .retain(|s| !(s.subscriber == *subscriber && s.filter == filter));
        self.omni
            .retain(|s| !(s.subscriber == *subscriber && s.filter == filter));
    }

    /// Remove every subscription held by a subscriber (logout, script
    /// replacement)
    pub fn remove_subscriber(&mut self, subscriber: &Subscriber) {
        self.simple.retain(|_, subs| {
            subs.retain(|s| s.subscriber != *subscriber);
            !subs.is_empty()
        });
        self.wildcard.retain(|s| s.subscriber != *subscriber);
        self.omni.retain(|s| s.subscriber != *subscriber);
    }

    /// All subscriptions matching a published topic: exact entries, then
    /// matching wildcard entries, then the omni tier (suppressed for
    /// `$`-prefixed topics).
    pub fn matches(&self, topic: &str) -> SmallVec<[&Subscription; 16]> {
        let mut result: SmallVec<[&Subscription; 16]> = SmallVec::new();

        if let Some(subs) = self.simple.get(topic) {
            result.extend(subs.iter());
        }

        for sub in &self.wildcard {
            if filter_matches(&sub.levels, topic) {
                result.push(sub);
            }
        }

        if !topic.starts_with('$') {
            result.extend(self.omni.iter());
        }

        result
    }

    pub fn len(&self) -> usize {
        self.simple.values().map(Vec::len).sum::<usize>() + self.wildcard.len() + self.omni.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
