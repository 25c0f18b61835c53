//! Alert fan-out to live listeners.
//!
//! Every connected listener (a WebSocket on `/listen`, or an in-process
//! subscriber) holds a receiver on a tokio broadcast channel. Alerts are sent
//! to all of them at once; having no listeners at all is normal.
//!
//! # Example
//!
//! ```rust
//! use threatguard_agent::broadcast::AlertBroadcaster;
//! use threatguard_agent::types::AlertMessage;
//!
//! let broadcaster = AlertBroadcaster::new();
//! let mut rx = broadcaster.subscribe();
//!
//! let alert = AlertMessage {
//!     kind: "alert".to_string(),
//!     level: "warning".to_string(),
//!     alert_type: "threat".to_string(),
//!     message: "Anomaly detected: login_attempt /login".to_string(),
//! };
//! assert_eq!(broadcaster.broadcast(alert), 1);
//! assert!(rx.try_recv().is_ok());
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::types::AlertMessage;

/// Default channel capacity.
///
/// Listeners that fall further behind than this receive
/// `RecvError::Lagged` and skip the missed alerts.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Distributes [`AlertMessage`]s to every current listener.
///
/// Cheap to clone; clones share the same channel.
#[derive(Debug, Clone)]
pub struct AlertBroadcaster {
    sender: Sender<AlertMessage>,
}

impl AlertBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given channel capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created alert broadcaster");
        Self { sender }
    }

    /// Registers a new listener. Only alerts sent after this call are
    /// received.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<AlertMessage> {
        let rx = self.sender.subscribe();
        debug!(listeners = self.subscriber_count(), "Listener connected");
        rx
    }

    /// Sends `alert` to every listener and returns how many received it.
    pub fn broadcast(&self, alert: AlertMessage) -> usize {
        trace!(message = %alert.message, "Broadcasting alert");
        match self.sender.send(alert) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No listeners connected, alert not delivered");
                0
            }
        }
    }

    /// Number of connected listeners.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AlertBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
