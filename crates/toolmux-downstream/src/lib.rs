//! The downstream client pool (C8) — lifecycle and routing across the two
//! supported transports — and the strict JSON-Schema validator (C4).

mod pool;
mod transport;
mod validator;

pub use pool::{server_name_from_tool, ConcurrencyGuard, DownstreamPool, PoolError};
pub use transport::{DownstreamTransport, HttpTransport, SubprocessTransport, TransportError};
pub use validator::{SchemaValidator, ValidationError, ValidationOutcome};
