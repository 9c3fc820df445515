//! Connection, subscription and tree-synchronization engine.
//!
//! Each configured server gets a [`ServerInstance`]: a connection manager
//! that establishes sessions lazily and retries in the background, a
//! subscription multiplexer that ref-counts local interest per remote id, a
//! change poller that fans updates out to the tree, and a nav synchronizer
//! that mirrors the remote hierarchy on demand.

pub mod actions;
pub mod nav;
pub mod poller;
pub mod subscribe;
pub mod supervisor;

mod server;

pub use actions::{ActionArgs, ActionBinding, ActionRegistry, DEFAULT_WRITE_LEVEL};
pub use nav::{NavSynchronizer, DEFAULT_MIN_REFRESH};
pub use poller::ChangePoller;
pub use server::{EngineOptions, ServerInstance};
pub use subscribe::{SubIndex, SubscriptionMultiplexer, DEFAULT_DEBOUNCE};
pub use supervisor::{ConnState, ConnectionManager, StatusSink};
