//! An async SoulSeek peer-to-peer protocol client.
//!
//! Wraps the server connection, peer message connections, the distributed
//! search-propagation overlay, and file transfers behind a single
//! [`client::Client`]: dial with [`client::Client::connect`], authenticate
//! with [`client::Client::login`], then search, browse, and transfer files.
//!
//! # Quick start
//!
//! ```no_run
//! use soulseek::client::Client;
//! use soulseek::config::ClientOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientOptions::default());
//!     client.connect("server.slsknet.org:2242".parse()?).await?;
//!     client.login("username", "password", 160, 1).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod distributed_manager;
pub mod error;
pub mod events;
pub mod messages;
pub mod peer_handler;
pub mod peer_manager;
pub mod search;
pub mod server_handler;
pub mod token_bucket;
pub mod transfer;
pub mod waiter;

pub use client::{Client, ClientState};
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::{SlskError, SlskResult};
pub use events::{DiagnosticSink, Event};
pub use search::{Scope, SearchOptions, SearchResultEntry};
