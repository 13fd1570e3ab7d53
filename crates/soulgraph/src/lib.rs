// Core data model and merge rules
pub mod crdt;
pub mod types;

// Plumbing shared by the store and connectors
pub mod error;
pub mod events;
pub mod middleware;

// Architecture modules
pub mod config;
pub mod connector;
pub mod federation;
pub mod graph;
pub mod http;
pub mod server;
pub mod storage;

// Public exports
pub use config::Config;
pub use connector::{AdapterConnector, GraphConnector, WireConnector, WireResponder};
pub use error::{Error, Result};
pub use federation::{FederatedAdapter, FederatedOptions, PeerSet};
pub use graph::{Client, Graph, Link, QueryValue, WriteValue};
pub use http::HttpAdapter;
pub use server::Server;
pub use storage::{GraphAdapter, MemoryAdapter, SqliteAdapter};
pub use types::{ChangeSetEntry, Edge, GetOpts, GraphData, Message, Node, State, Value};
