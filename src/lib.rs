//! Device-side runtime connecting embedded equipment to a remote management
//! server over HTTP(S): registration, message delivery, file transfer, SOAP
//! command dispatch, and remote-session tunneling.
//!
//! The crate is a library first: it owns no event loop of its own. A host
//! binary (see `src/main.rs`) builds an [`AgentConfig`](config::AgentConfig),
//! constructs the subsystems it needs (`MessageQueue`, `ServerSession`,
//! `FileTransferEngine`, `RemoteSession`), and drives them with its own
//! `tokio` tasks.

pub mod config;
pub mod connection;
pub mod domain_types;
pub mod emessage;
pub mod error;
pub mod file_transfer;
pub mod http;
pub mod observability;
pub mod queue;
pub mod remote_session;
pub mod server_session;
pub mod soap;
pub mod user_agent;

pub use config::AgentConfig;
pub use error::AxedaError;
pub use queue::MessageQueue;
pub use server_session::ServerSession;
