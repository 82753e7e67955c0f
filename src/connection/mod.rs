//! TCP connection plumbing: raw lifecycle, message framing, inbound
//! classification, and the direct/indirect establishment race.

pub mod establishment;
pub mod listener;
pub mod message_connection;
pub mod raw;

pub use establishment::race_until_first_success;
pub use listener::{ClassifiedConnection, Listener};
pub use message_connection::MessageConnection;
pub use raw::{ConnectionState, RawConnection};
