//! Tideline keeps a client's view of channel and DM conversations
//! consistent with a server of record: a persistent websocket delivers
//! push events, a fixed-cadence REST poll backstops anything the socket
//! drops, and the reconciliation store merges both into one ordered,
//! deduplicated read model. See [`client::SyncClient`] for the surface
//! a UI layer consumes.

pub mod api;
pub mod client;
pub mod config;
pub mod presence;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use tideline_proto as proto;
