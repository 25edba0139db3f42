use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{Subscription, SubscriptionId};

/// Local channel-to-subscriber table shared by both backends.
#[derive(Default)]
pub(crate) struct Fanout {
    inner: RwLock<Table>,
}

#[derive(Default)]
struct Table {
    channels: HashMap<String, HashMap<SubscriptionId, mpsc::Sender<Bytes>>>,
    owners: HashMap<SubscriptionId, String>,
}

impl Fanout {
    /// Registers a subscriber. The flag is true when it is the channel's first.
    pub(crate) fn add(&self, channel: &str, buffer: usize) -> (Subscription, bool) {
        let (sender, receiver) = mpsc::channel(buffer);
        let id = SubscriptionId::next();
        let mut table = self.inner.write();
        let subscribers = table.channels.entry(channel.to_string()).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(id, sender);
        table.owners.insert(id, channel.to_string());
        (
            Subscription {
                id,
                channel: channel.to_string(),
                receiver,
            },
            first,
        )
    }

    /// Drops the subscriber's sender. Returns its channel and whether it was
    /// the last subscriber there.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let mut table = self.inner.write();
        let channel = table.owners.remove(&id)?;
        let last = match table.channels.get_mut(&channel) {
            Some(subscribers) => {
                subscribers.remove(&id);
                subscribers.is_empty()
            }
            None => true,
        };
        if last {
            table.channels.remove(&channel);
        }
        Some((channel, last))
    }

    pub(crate) fn senders(&self, channel: &str) -> Vec<mpsc::Sender<Bytes>> {
        self.inner
            .read()
            .channels
            .get(channel)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }
}
