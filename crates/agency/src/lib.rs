//! agency: client side of the lottery agency/central protocol.

pub mod bets;
pub mod config;
pub mod events;
pub mod session;
pub mod wire;

/// Agency version from Cargo.toml
pub const AGENCY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bets::{LoadError, load_bets, parse_bets};
pub use config::{AgencyConfig, ConfigError};
pub use events::{LogEvents, SessionEvent, SessionEvents};
pub use session::{
    AckMode, BatchProgress, Phase, Rejection, RetryPolicy, Session, SessionConfig, SessionError,
    SessionReport,
};
pub use wire::codec::CodecError;
pub use wire::protocol::Bet;
pub use wire::transport::{Connector, TcpConnector};
