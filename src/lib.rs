//! etcdsql serves the etcd v2 key-value HTTP API on top of a plain
//! relational database. The database's transactions stand in for the
//! consensus log: every mutation advances a single-row index counter,
//! rewrites node rows, and appends a change record that the watcher
//! replays to long-poll clients.
//!
//! - [`kv`]: the storage engine (dialects, the node store, TTL
//!   expiration, the change ring and watcher task)
//! - [`api`]: the HTTP surface and request decoding
//! - [`models`]: the wire shapes (nodes, envelopes, the error model)

pub mod api;
pub mod kv;
pub mod models;
