//! Offline mutation queue and optimistic projection for shared lists.
//!
//! Local intents (add, check, uncheck, reorder) are persisted to a
//! [`store::LocalStore`] and replayed against the backend in order by a
//! [`queue::MutationQueue`]. A [`view::ListView`] renders the authoritative
//! snapshot merged with whatever is still queued, via
//! [`projection::project`].

pub mod config;
pub mod connectivity;
pub mod logging;
pub mod model;
pub mod mutation;
pub mod notify;
pub mod projection;
pub mod queue;
pub mod remote;
pub mod snapshot;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod view;
