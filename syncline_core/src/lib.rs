//! # Syncline
//!
//! Keeps a local reactive cache consistent with a remote change-stream.
//!
//! The crate is organised around one logical *channel* per resource scope (a chat room, or a
//! user's check-ins). A [`ConnectionManager`](connection::ConnectionManager) owns the
//! subscription lifecycle, and observers attached to it turn remote change events into local
//! cache mutations:
//!
//! - [`EventBuffer`](buffer::EventBuffer) batches message inserts into the
//!   [`PagedStore`](paged::PagedStore),
//! - [`DebouncedInvalidator`](invalidator::DebouncedInvalidator) coalesces bursts of
//!   low-value notifications into one refetch,
//! - [`RemoteSignals`](signal::RemoteSignals) tracks typing and presence broadcasts.
//!
//! Outgoing writes go through the [`MutationCoordinator`](mutation::MutationCoordinator), and
//! outgoing typing signals through the [`SignalTracker`](signal::SignalTracker).
//! [`ChatRoomSync`](consumer::ChatRoomSync) and [`CheckInSync`](consumer::CheckInSync) wire
//! everything together for a mounted view.

#![deny(missing_docs)]

pub mod buffer;
pub mod change_stream;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod invalidator;
pub mod mutation;
pub mod paged;
pub mod query_cache;
pub mod record;
pub mod registry;
mod retry;
pub mod scope;
pub mod session;
pub mod signal;
pub mod timer;

pub mod prelude {
    //! The prelude module for the `syncline_core` crate.
    pub use super::buffer::*;
    pub use super::change_stream::*;
    pub use super::config::*;
    pub use super::connection::*;
    pub use super::consumer::*;
    pub use super::error::*;
    pub use super::event::*;
    pub use super::invalidator::*;
    pub use super::mutation::*;
    pub use super::paged::*;
    pub use super::query_cache::*;
    pub use super::record::*;
    pub use super::registry::*;
    pub use super::scope::*;
    pub use super::session::*;
    pub use super::signal::*;
    pub use super::timer::*;
}
