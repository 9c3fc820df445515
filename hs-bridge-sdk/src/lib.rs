//! Shared vocabulary for hs-bridge: the tagged value model, tabular results,
//! the error taxonomy, retry policy, connection configuration, and the traits
//! at the two external seams (remote client, local node tree).

mod client;
mod config;
mod error;
mod grid;
mod retry;
mod tree;
mod value;

pub use client::{ClientFactory, HaystackClient, HaystackWatch, OP_WATCH_SUB};
pub use config::ConnectionConfig;
pub use error::{BridgeError, BridgeResult, PERMISSION_ERR_PREFIX};
pub use grid::{Grid, Row};
pub use retry::{build_backoff, RetryPolicy};
pub use tree::{
    encode_name, join, MemoryTree, NodePath, NodeTree, TreeEvent, ROOT_PATH,
};
pub use value::{
    parse_number_with_unit, HsRef, HsValue, TreeValue, ValueCastError, ValueKind,
};
