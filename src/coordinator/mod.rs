//! Routing coordinator
//!
//! Ties the pieces together for the host application:
//!
//! - the live [`RouteTable`](crate::rules::RouteTable) behind an `ArcSwap`,
//!   edited through compare-and-swap loops
//! - [`RouteSnapshot`] publication with replay for late subscribers
//! - a supervised link to the privileged background service that reconnects
//!   after a fixed backoff
//! - lifecycle signals (resume, network change, config reload, reconnect)
//!   that invalidate cached decisions
//!
//! # State machine
//!
//! ```text
//! Uninitialized --initialize--> Binding --linked--> Active
//!                                  ^                  |
//!                                  |              link lost
//!                               backoff               v
//!                                  +------------ Disconnected
//!
//! Binding --refused for good--> Error --on_resume--> Binding
//! ```

mod broadcast;
mod manager;
mod service;
mod state;
pub mod unix;

pub use broadcast::{SnapshotBroadcaster, SnapshotSubscription, DEFAULT_BUFFER, DEFAULT_REPLAY};
pub use manager::{
    CoordinatorOptions, RoutingCoordinator, DEFAULT_EVENT_BUFFER, DEFAULT_LINK_TIMEOUT,
    DEFAULT_MAX_ACTIVE_ROUTES, DEFAULT_RECONNECT_BACKOFF,
};
pub use service::{EventSender, ServiceConnector, ServiceEvent, ServiceHandle};
pub use state::{CoordinatorState, RouteSnapshot, SnapshotStatus};
pub use unix::UnixServiceConnector;
