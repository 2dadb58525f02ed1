//! Stand-in control-plane server
//!
//! Speaks just enough of the server contract for the fixture to drive it:
//! the launch flags, the admin client config, health and metrics endpoints,
//! audit logging and an embedded store with a flush on shutdown. A handful of
//! extra flags make it fail in controlled ways.

pub mod args;
pub mod entry;
pub mod error;
pub mod server;
pub mod store;

pub use args::Args;
pub use entry::StubServerEntry;
pub use error::{StubServerError, StubServerResult};
pub use server::{ServerState, StatusReport, StubServer};
pub use store::Store;
