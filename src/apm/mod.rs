//! Topology and Pool Monitoring
//!
//! The APM module lets applications observe discovery, heartbeats and connection pool activity.
//! Handlers registered on a cluster receive every event synchronously on the thread that
//! produced it, so they should return quickly. Every event is also logged at trace level.
mod event;
mod listener;

pub use self::event::{
    CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason, SdamEvent,
};
pub use self::listener::Listener;

/// Receives monitoring events. Both methods default to doing nothing.
pub trait EventHandler: Send + Sync {
    fn handle_sdam_event(&self, _event: &SdamEvent) {}

    fn handle_cmap_event(&self, _event: &CmapEvent) {}
}
