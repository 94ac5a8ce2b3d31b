use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per place.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to every committed event of a place. Creates the channel if needed.
    pub fn subscribe(&self, place_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(place_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, place_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&place_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a place's channel once the place is gone.
    pub fn remove(&self, place_id: &Ulid) {
        self.channels.remove(place_id);
    }
}
