//! Wire protocol types for agency-central communication.
//!
//! Requests travel agency -> central inside length-prefixed envelopes.
//! Replies are raw for acknowledgements (4-byte number or 1-byte flag) and
//! enveloped for the winners list.

use std::fmt;

use tokio_util::bytes::BytesMut;

/// Control tag announcing that an agency has submitted all its bets.
pub const FINISH_TAG: &str = "FIN_APUESTAS";

/// Control tag asking the central for the agency's winners.
pub const WINNERS_QUERY_TAG: &str = "CONSULTA_GANADORES";

/// Winners reply sent while the draw has not happened yet.
pub const DRAW_PENDING_SENTINEL: &str = "ERROR_NO_SORTEO";

/// Separator between the fields of a record and between winners.
pub const FIELD_SEPARATOR: char = '|';

/// Separator between the records of a batch.
pub const RECORD_SEPARATOR: char = '\n';

/// Number of `|`-separated fields in a serialized bet.
pub const BET_FIELDS: usize = 6;

/// A single bet placed at an agency.
///
/// The number is kept in its textual form and only parsed when comparing it
/// against a numeric acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    agency: String,
    first_name: String,
    last_name: String,
    document: String,
    birth_date: String,
    number: String,
}

impl Bet {
    pub fn new(
        agency: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        document: impl Into<String>,
        birth_date: impl Into<String>,
        number: impl Into<String>,
    ) -> Self {
        Self {
            agency: agency.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            document: document.into(),
            birth_date: birth_date.into(),
            number: number.into(),
        }
    }

    pub fn agency(&self) -> &str {
        &self.agency
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn birth_date(&self) -> &str {
        &self.birth_date
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// Numeric value of the bet number, if it fits the 4-byte ack width.
    pub fn number_value(&self) -> Option<u32> {
        self.number.trim().parse().ok()
    }

    /// Fields in wire order.
    pub fn fields(&self) -> [(&'static str, &str); BET_FIELDS] {
        [
            ("agency", self.agency.as_str()),
            ("first_name", self.first_name.as_str()),
            ("last_name", self.last_name.as_str()),
            ("document", self.document.as_str()),
            ("birth_date", self.birth_date.as_str()),
            ("number", self.number.as_str()),
        ]
    }
}

/// Control messages share one shape: `<TAG>|<agency>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    Finish,
    QueryWinners,
}

impl ControlTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finish => FINISH_TAG,
            Self::QueryWinners => WINNERS_QUERY_TAG,
        }
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages from agency to central. Batches borrow the caller's records.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    Batch(&'a [Bet]),
    Control { tag: ControlTag, agency: &'a str },
}

impl<'a> Request<'a> {
    pub fn finish(agency: &'a str) -> Self {
        Self::Control {
            tag: ControlTag::Finish,
            agency,
        }
    }

    pub fn query_winners(agency: &'a str) -> Self {
        Self::Control {
            tag: ControlTag::QueryWinners,
            agency,
        }
    }
}

/// A request as decoded on the central side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Bets(Vec<Bet>),
    Finish { agency: String },
    QueryWinners { agency: String },
}

/// Which reply the agency is waiting for. The wire carries no type tag, so
/// the decoder has to be told.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyKind {
    /// 4-byte big-endian number of the last processed bet.
    #[default]
    Ack,
    /// 1-byte accept (`1`) / reject flag.
    Status,
    /// Length-prefixed payload.
    Envelope,
}

/// Replies as seen by the agency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(u32),
    Status(bool),
    Envelope(BytesMut),
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Self::Ack(_) => ReplyKind::Ack,
            Self::Status(_) => ReplyKind::Status,
            Self::Envelope(_) => ReplyKind::Envelope,
        }
    }
}

/// Winners reply as produced by the central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Winners {
    DrawPending,
    Documents(Vec<String>),
}

/// Replies as produced by the central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralReply {
    Ack(u32),
    Status(bool),
    Winners(Winners),
}
