use crate::prelude::*;

/// Every component talks through here; no direct references between
/// tasks. Broadcast senders are cheap to clone and receivers are created
/// on subscription.
#[derive(Debug, Clone)]
pub struct Channels {
    /// Poll results: bus task -> coordinator
    pub from_bus: broadcast::Sender<poller::ChannelData>,
    /// Command writes for the RS-485 bus: coordinator -> bus task
    pub to_bus: broadcast::Sender<poller::BusCommand>,
    /// Modbus requests and client events: TCP server -> coordinator
    pub to_coordinator: broadcast::Sender<coordinator::ChannelData>,
    /// Snapshots: coordinator -> monitor
    pub from_coordinator: broadcast::Sender<monitor::ChannelData>,
    /// Shutdown fan-out for the TCP server
    pub to_server: broadcast::Sender<server::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_bus: Self::channel(),
            to_bus: Self::channel(),
            to_coordinator: Self::channel(),
            from_coordinator: Self::channel(),
            to_server: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
