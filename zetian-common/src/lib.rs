pub mod address;
pub mod domain;
pub mod envelope;
pub mod headers;
pub mod logging;
pub mod session_info;
pub mod status;
pub mod verdict;

pub use address::{Address, AddressError};
pub use domain::Domain;
pub use envelope::{BodyRef, Envelope, EnvelopeBuilder, EnvelopeId, TlsState};
pub use headers::HeaderMap;
pub use session_info::{SessionInfo, SessionRegistryRecord};
pub use status::Status;
pub use tracing;
pub use verdict::{FilterAction, Verdict};

/// Broadcast payload used to coordinate shutdown across server tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
