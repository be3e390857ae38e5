//! Wire layer between an agency and the central.
//!
//! Every request is a length-prefixed UTF-8 envelope. Replies are either a
//! raw fixed-size acknowledgement or another envelope.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Bet, Request/Reply, Submission/CentralReply)
//! - **codec**: Envelope framing plus agency-side and central-side codecs
//! - **transport**: Connector trait and a framed Connection over AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
pub mod transport;
