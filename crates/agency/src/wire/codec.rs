//! Framing codecs for agency-central communication.
//!
//! Uses LengthDelimitedCodec with a 2-byte big-endian length field for
//! envelopes, plus raw fixed-width acknowledgements. Works over any
//! AsyncRead/AsyncWrite (TCP sockets, in-memory duplex streams).

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{
    BET_FIELDS, Bet, CentralReply, ControlTag, DRAW_PENDING_SENTINEL, FIELD_SEPARATOR, FINISH_TAG,
    RECORD_SEPARATOR, Reply, ReplyKind, Request, Submission, WINNERS_QUERY_TAG, Winners,
};

/// Width of the envelope length prefix.
pub const LENGTH_FIELD_LEN: usize = 2;

/// Largest payload the 2-byte length prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Batches above this size are sent anyway, with a warning.
pub const BATCH_SIZE_ADVISORY: usize = 8 * 1024;

/// Width of a numeric acknowledgement.
pub const ACK_LEN: usize = 4;

/// Width of a boolean acknowledgement.
pub const STATUS_LEN: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode an empty batch")]
    EmptyBatch,
    #[error("payload of {len} bytes exceeds the {} byte envelope limit", MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },
    #[error("field `{field}` contains a protocol separator")]
    DelimiterInField { field: &'static str },
    #[error("connection closed with {buffered} bytes of an incomplete message")]
    ShortRead { buffered: usize },
    #[error("connection closed by peer")]
    Disconnected,
    #[error("draw has not been run yet")]
    DrawNotYetRun,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the peer went away cleanly or the socket was torn down,
    /// as opposed to a message that arrived but made no sense.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Length-prefixed envelope: 2-byte big-endian length, then that many bytes.
///
/// Wraps LengthDelimitedCodec and tells a clean close apart from a close in
/// the middle of a frame.
#[derive(Debug)]
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
    in_frame: bool,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_LEN)
                .max_frame_length(MAX_PAYLOAD_LEN)
                .new_codec(),
            in_frame: false,
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let before = src.len();
        let frame = self.inner.decode(src)?;
        // The inner codec consumes the header as soon as it has it.
        self.in_frame = frame.is_none() && (self.in_frame || src.len() < before);
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && !self.in_frame => Ok(None),
            None => Err(CodecError::ShortRead {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge { len });
        }
        tracing::trace!(payload_bytes = len, "Encoding envelope");
        self.inner.encode(payload, dst)?;
        Ok(())
    }
}

/// Serialize a batch as `agency|first|last|document|birth|number` lines
/// joined by `\n`.
pub fn batch_payload(bets: &[Bet]) -> Result<String, CodecError> {
    if bets.is_empty() {
        return Err(CodecError::EmptyBatch);
    }

    let mut payload = String::new();
    for (i, bet) in bets.iter().enumerate() {
        if i > 0 {
            payload.push(RECORD_SEPARATOR);
        }
        for (j, (field, value)) in bet.fields().into_iter().enumerate() {
            if value.contains([FIELD_SEPARATOR, RECORD_SEPARATOR]) {
                return Err(CodecError::DelimiterInField { field });
            }
            if j > 0 {
                payload.push(FIELD_SEPARATOR);
            }
            payload.push_str(value);
        }
    }

    if payload.len() > BATCH_SIZE_ADVISORY {
        tracing::warn!(
            payload_bytes = payload.len(),
            advisory_bytes = BATCH_SIZE_ADVISORY,
            batch_size = bets.len(),
            "Batch exceeds advisory size, sending anyway"
        );
    }
    Ok(payload)
}

pub fn control_payload(tag: ControlTag, agency: &str) -> String {
    format!("{}{}{}", tag.as_str(), FIELD_SEPARATOR, agency)
}

/// Encode a batch into a complete envelope.
pub fn encode_batch(bets: &[Bet]) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    EnvelopeCodec::new().encode(Bytes::from(batch_payload(bets)?), &mut dst)?;
    Ok(dst.freeze())
}

/// Encode a control message into a complete envelope.
pub fn encode_control(tag: ControlTag, agency: &str) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    EnvelopeCodec::new().encode(Bytes::from(control_payload(tag, agency)), &mut dst)?;
    Ok(dst.freeze())
}

/// Number of the last bet the central processed.
pub fn decode_ack(payload: &[u8]) -> Result<u32, CodecError> {
    let bytes: [u8; ACK_LEN] = payload.try_into().map_err(|_| {
        CodecError::Malformed(format!(
            "ack must be {} bytes, got {}",
            ACK_LEN,
            payload.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

/// `1` accepts, anything else rejects.
pub fn decode_batch_status(payload: &[u8]) -> Result<bool, CodecError> {
    match payload {
        [flag] => Ok(*flag == 1),
        _ => Err(CodecError::Malformed(format!(
            "status must be {} byte, got {}",
            STATUS_LEN,
            payload.len()
        ))),
    }
}

/// Document ids of the agency's winners.
///
/// Empty segments are skipped, so both an empty payload and a trailing
/// separator are accepted.
pub fn decode_winners(payload: &[u8]) -> Result<Vec<String>, CodecError> {
    let text = std::str::from_utf8(payload)?;
    if text == DRAW_PENDING_SENTINEL {
        return Err(CodecError::DrawNotYetRun);
    }
    Ok(text
        .split(FIELD_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Central-side parse of an envelope payload.
pub fn decode_submission(payload: &[u8]) -> Result<Submission, CodecError> {
    let text = std::str::from_utf8(payload)?;

    if let Some(agency) = control_agency(text, FINISH_TAG)? {
        return Ok(Submission::Finish { agency });
    }
    if let Some(agency) = control_agency(text, WINNERS_QUERY_TAG)? {
        return Ok(Submission::QueryWinners { agency });
    }
    if text.is_empty() {
        return Err(CodecError::EmptyBatch);
    }

    text.split(RECORD_SEPARATOR)
        .enumerate()
        .map(|(i, line)| {
            let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
            match fields.as_slice() {
                [agency, first, last, document, birth, number] => {
                    Ok(Bet::new(*agency, *first, *last, *document, *birth, *number))
                }
                _ => Err(CodecError::Malformed(format!(
                    "record {} has {} fields, expected {}",
                    i + 1,
                    fields.len(),
                    BET_FIELDS
                ))),
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Submission::Bets)
}

/// A control message is exactly `<TAG>|<agency>`. Anything longer is a batch,
/// even when its first bet's agency id equals a tag.
fn control_agency(text: &str, tag: &str) -> Result<Option<String>, CodecError> {
    let Some(agency) = text
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(FIELD_SEPARATOR))
    else {
        return Ok(None);
    };
    if agency.contains([FIELD_SEPARATOR, RECORD_SEPARATOR]) {
        return Ok(None);
    }
    if agency.is_empty() {
        return Err(CodecError::Malformed(format!("missing agency in {} message", tag)));
    }
    Ok(Some(agency.to_string()))
}

fn take_fixed(src: &mut BytesMut, len: usize) -> Option<BytesMut> {
    if src.len() < len {
        src.reserve(len - src.len());
        return None;
    }
    Some(src.split_to(len))
}

/// Agency side: encodes requests, decodes whichever reply it was told to expect.
#[derive(Debug, Default)]
pub struct AgencyCodec {
    envelope: EnvelopeCodec,
    expecting: ReplyKind,
}

impl AgencyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shape of the next reply.
    pub fn expect(&mut self, kind: ReplyKind) {
        self.expecting = kind;
    }

    pub fn expecting(&self) -> ReplyKind {
        self.expecting
    }
}

impl<'a> Encoder<Request<'a>> for AgencyCodec {
    type Error = CodecError;

    fn encode(&mut self, request: Request<'a>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = match request {
            Request::Batch(bets) => batch_payload(bets)?,
            Request::Control { tag, agency } => control_payload(tag, agency),
        };
        self.envelope.encode(Bytes::from(payload), dst)
    }
}

impl Decoder for AgencyCodec {
    type Item = Reply;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.expecting {
            ReplyKind::Ack => take_fixed(src, ACK_LEN)
                .map(|raw| decode_ack(&raw).map(Reply::Ack))
                .transpose(),
            ReplyKind::Status => take_fixed(src, STATUS_LEN)
                .map(|raw| decode_batch_status(&raw).map(Reply::Status))
                .transpose(),
            ReplyKind::Envelope => Ok(self.envelope.decode(src)?.map(Reply::Envelope)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.expecting {
            ReplyKind::Envelope => Ok(self.envelope.decode_eof(src)?.map(Reply::Envelope)),
            _ => match self.decode(src)? {
                Some(reply) => Ok(Some(reply)),
                None if src.is_empty() => Ok(None),
                None => Err(CodecError::ShortRead {
                    buffered: src.len(),
                }),
            },
        }
    }
}

/// Central side: decodes submissions, encodes acknowledgements and winners.
#[derive(Debug, Default)]
pub struct CentralCodec {
    envelope: EnvelopeCodec,
}

impl CentralCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for CentralCodec {
    type Item = Submission;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.envelope
            .decode(src)?
            .map(|payload| decode_submission(&payload))
            .transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.envelope
            .decode_eof(src)?
            .map(|payload| decode_submission(&payload))
            .transpose()
    }
}

impl Encoder<CentralReply> for CentralCodec {
    type Error = CodecError;

    fn encode(&mut self, reply: CentralReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match reply {
            CentralReply::Ack(number) => dst.put_u32(number),
            CentralReply::Status(accepted) => dst.put_u8(u8::from(accepted)),
            CentralReply::Winners(Winners::DrawPending) => {
                self.envelope
                    .encode(Bytes::from_static(DRAW_PENDING_SENTINEL.as_bytes()), dst)?;
            }
            CentralReply::Winners(Winners::Documents(documents)) => {
                let separator = FIELD_SEPARATOR.to_string();
                let joined = documents.join(separator.as_str());
                self.envelope.encode(Bytes::from(joined), dst)?;
            }
        }
        Ok(())
    }
}
