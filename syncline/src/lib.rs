//! # Syncline
//!
//! Keeps a local reactive cache consistent with a remote change-stream: channel lifecycle
//! with retry and backoff, batched event application, debounced invalidation, optimistic
//! sends with rollback, and typing/presence signals.
//!
//! Everything lives in [`prelude`]. Enable the `in-memory` feature for in-memory
//! implementations of the change-stream, query cache, page store and session provider.

#![deny(missing_docs)]

#[cfg(feature = "in-memory")]
/// In-memory backends for the `syncline` crate.
pub mod mem {
    //! Contains the in-memory collaborators.
    pub use syncline_mem::*;
}

pub mod prelude {
    //! The prelude module for the `syncline` crate.
    pub use syncline_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
}
