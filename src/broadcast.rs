//! Per-assembly fan-out of accepted changes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::ChangeMessage;

pub const DEFAULT_CAPACITY: usize = 256;

/// One tokio broadcast channel per assembly. Messages are published while the
/// submission lock is held, so each channel sees them in acceptance order.
///
/// A subscriber that falls more than `capacity` messages behind gets
/// `RecvError::Lagged` and should re-fetch, the same as a sequence gap.
pub struct BroadcastHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ChangeMessage>>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChangeMessage> {
        let mut channels = self.channels.lock().expect("broadcast hub lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a channel's current subscribers. Returns how many received it.
    pub fn publish(&self, message: ChangeMessage) -> usize {
        let mut channels = self.channels.lock().expect("broadcast hub lock poisoned");
        let Some(sender) = channels.get(&message.channel) else {
            return 0;
        };
        let channel = message.channel.clone();
        match sender.send(message) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Every receiver is gone.
                channels.remove(&channel);
                0
            }
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().expect("broadcast hub lock poisoned");
        channels.get(channel).map_or(0, |s| s.receiver_count())
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
