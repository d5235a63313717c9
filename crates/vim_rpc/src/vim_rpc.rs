mod connection;
mod correlator;
mod message;

pub use connection::Connection;
#[cfg(any(test, feature = "test-support"))]
pub use connection::FakeEditorEnd;
pub use correlator::{Accepted, Correlator, CorrelatorState};
pub use message::{Envelope, Outbound, ProtocolError};
