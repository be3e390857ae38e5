//! Session - drives one agency's run against the central.
//!
//! Flow:
//! 1. Connect (once for the run, or once per exchange)
//! 2. Submit bets in batches, each acknowledged before the next is sent
//! 3. Notify the central that the agency has finished
//! 4. Query winners, retrying with a fixed delay while the draw is pending
//! 5. Close the connection on every exit path
//!
//! Only the winners query is retried. A rejected batch or finish
//! notification ends the run.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::{LogEvents, SessionEvent, SessionEvents};
use crate::wire::codec::{CodecError, decode_winners};
use crate::wire::protocol::{Bet, Reply, ReplyKind, Request};
use crate::wire::transport::{Connection, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// How the central acknowledges a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// 4-byte number of the last bet processed, compared against the
    /// batch's last bet.
    #[default]
    LastNumber,
    /// 1-byte accept/reject flag.
    Flag,
}

impl AckMode {
    fn reply_kind(&self) -> ReplyKind {
        match self {
            Self::LastNumber => ReplyKind::Ack,
            Self::Flag => ReplyKind::Status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agency: String,
    pub batch_max_amount: usize,
    pub ack_mode: AckMode,
    /// Open a fresh connection for every exchange instead of holding one.
    pub connection_per_batch: bool,
    pub winners_retry: RetryPolicy,
    pub reply_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(agency: impl Into<String>) -> Self {
        Self {
            agency: agency.into(),
            batch_max_amount: 100,
            ack_mode: AckMode::default(),
            connection_per_batch: false,
            winners_retry: RetryPolicy::default(),
            reply_timeout: None,
        }
    }

    pub fn with_batch_max_amount(mut self, n: usize) -> Self {
        self.batch_max_amount = n.max(1);
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_connection_per_batch(mut self, per_batch: bool) -> Self {
        self.connection_per_batch = per_batch;
        self
    }

    pub fn with_winners_retry(mut self, policy: RetryPolicy) -> Self {
        self.winners_retry = policy;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Submitting,
    Finishing,
    QueryingWinners,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Submitting => "submitting",
            Self::Finishing => "finishing",
            Self::QueryingWinners => "querying_winners",
            Self::Closed => "closed",
        }
    }

    /// Log action name for failures in this phase.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Connecting => "connect",
            Self::Submitting => "batch_sent",
            Self::Finishing => "finish_notification",
            Self::QueryingWinners => "consulta_ganadores",
            Self::Closed => "close_connection",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a batch was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Mismatch { expected: u32, acked: u32 },
    /// Numeric ack of 0.
    NothingProcessed,
    /// Flag ack other than 1.
    Refused,
    /// The batch's last bet number cannot be compared against an ack.
    UnparsableNumber(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, acked } => {
                write!(f, "central acked bet {} but batch ends at {}", acked, expected)
            }
            Self::NothingProcessed => f.write_str("central processed no bets"),
            Self::Refused => f.write_str("central refused the batch"),
            Self::UnparsableNumber(number) => write!(f, "bet number '{}' is not numeric", number),
        }
    }
}

/// Where a submission stood when its transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based number of the batch in flight.
    pub batch: usize,
    /// Bets acknowledged before that batch.
    pub acked_records: usize,
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " at batch {} after {} acknowledged bets",
            self.batch, self.acked_records
        )
    }
}

fn progress_suffix(progress: &Option<BatchProgress>) -> String {
    progress.map(|p| p.to_string()).unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("shutdown requested while {phase}")]
    Cancelled { phase: Phase },
    #[error("failed to connect to {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send while {phase}{}: {source}", progress_suffix(.progress))]
    SendFailed {
        phase: Phase,
        progress: Option<BatchProgress>,
        #[source]
        source: CodecError,
    },
    #[error("no acknowledgement while {phase}{}: {source}", progress_suffix(.progress))]
    AckTimeoutOrTransportError {
        phase: Phase,
        progress: Option<BatchProgress>,
        #[source]
        source: CodecError,
    },
    #[error("batch {batch} rejected after {acked_records} acknowledged bets: {reason}")]
    BatchRejected {
        batch: usize,
        acked_records: usize,
        reason: Rejection,
    },
    #[error("central refused the finish notification")]
    FinishRejected,
    #[error("draw has not been run yet")]
    DrawPending,
    #[error("winners query failed after {attempts} attempts: {reason}")]
    DrawQueryFailed { attempts: u32, reason: String },
}

impl SessionError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Cancelled { phase } => *phase,
            Self::ConnectFailed { .. } => Phase::Connecting,
            Self::SendFailed { phase, .. } => *phase,
            Self::AckTimeoutOrTransportError { phase, .. } => *phase,
            Self::BatchRejected { .. } => Phase::Submitting,
            Self::FinishRejected => Phase::Finishing,
            Self::DrawPending | Self::DrawQueryFailed { .. } => Phase::QueryingWinners,
        }
    }

    /// Some batches were stored before the run failed.
    pub fn is_partial(&self) -> bool {
        match self {
            Self::BatchRejected { acked_records, .. } => *acked_records > 0,
            Self::SendFailed { progress, .. } | Self::AckTimeoutOrTransportError { progress, .. } => {
                progress.is_some_and(|p| p.acked_records > 0)
            }
            _ => false,
        }
    }

    /// Attach submission progress to a transport failure.
    fn during_batch(mut self, batch: usize, acked_records: usize) -> Self {
        if let Self::SendFailed { progress, .. } | Self::AckTimeoutOrTransportError { progress, .. } =
            &mut self
        {
            *progress = Some(BatchProgress {
                batch,
                acked_records,
            });
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DrawPending)
    }

    fn is_connection_lost(&self) -> bool {
        match self {
            Self::SendFailed { source, .. } | Self::AckTimeoutOrTransportError { source, .. } => {
                source.is_connection_lost()
            }
            _ => false,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub agency: String,
    pub batches_sent: usize,
    pub records_sent: usize,
    pub winners: Vec<String>,
    pub winners_attempts: u32,
}

/// Split bets into consecutive batches of at most `max` (at least 1).
pub fn partition(bets: &[Bet], max: usize) -> std::slice::Chunks<'_, Bet> {
    bets.chunks(max.max(1))
}

/// Accept iff the ack names the batch's last bet.
pub fn verify_ack(expected: u32, acked: u32) -> Result<u32, Rejection> {
    if acked == expected {
        Ok(acked)
    } else if acked == 0 {
        Err(Rejection::NothingProcessed)
    } else {
        Err(Rejection::Mismatch { expected, acked })
    }
}

fn expected_last_number(batch: &[Bet]) -> Result<u32, Rejection> {
    let last = batch
        .last()
        .ok_or_else(|| Rejection::UnparsableNumber(String::new()))?;
    last.number_value()
        .ok_or_else(|| Rejection::UnparsableNumber(last.number().to_string()))
}

fn unexpected_reply(phase: Phase, reply: &Reply) -> SessionError {
    SessionError::AckTimeoutOrTransportError {
        phase,
        progress: None,
        source: CodecError::Malformed(format!("unexpected {:?} reply", reply.kind())),
    }
}

/// One agency run over one logical connection.
pub struct Session<C: Connector, E: SessionEvents = LogEvents> {
    config: SessionConfig,
    connector: C,
    events: E,
    cancel: CancellationToken,
    connection: Option<Connection<C::Stream>>,
    phase: Phase,
}

impl<C: Connector> Session<C, LogEvents> {
    pub fn new(config: SessionConfig, connector: C) -> Self {
        Self::with_events(config, connector, LogEvents)
    }
}

impl<C: Connector, E: SessionEvents> Session<C, E> {
    pub fn with_events(config: SessionConfig, connector: C, events: E) -> Self {
        Self {
            config,
            connector,
            events,
            cancel: CancellationToken::new(),
            connection: None,
            phase: Phase::Connecting,
        }
    }

    /// Observe `token` at every suspension point between exchanges.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run every phase in order. The connection is closed before this returns,
    /// whatever the outcome.
    pub async fn run(mut self, bets: &[Bet]) -> Result<SessionReport, SessionError> {
        let result = self.drive(bets).await;

        if let Err(error) = &result {
            match error {
                SessionError::Cancelled { phase } => {
                    self.emit(SessionEvent::Shutdown { phase: *phase });
                }
                // Already reported with their own event.
                SessionError::BatchRejected { .. } | SessionError::FinishRejected => {}
                _ => self.emit(SessionEvent::PhaseFailed { error }),
            }
        }

        if let Some(connection) = self.connection.take() {
            self.close(connection).await;
        }
        self.phase = Phase::Closed;
        result
    }

    async fn drive(&mut self, bets: &[Bet]) -> Result<SessionReport, SessionError> {
        self.checkpoint()?;

        if !self.config.connection_per_batch {
            let connection = self.open().await?;
            self.connection = Some(connection);
        }

        let mut report = SessionReport {
            agency: self.config.agency.clone(),
            ..SessionReport::default()
        };

        self.submit(bets, &mut report).await?;
        self.finish().await?;
        let (winners, attempts) = self.query_winners().await?;
        report.winners = winners;
        report.winners_attempts = attempts;

        Ok(report)
    }

    async fn submit(&mut self, bets: &[Bet], report: &mut SessionReport) -> Result<(), SessionError> {
        self.enter(Phase::Submitting);
        let mode = self.config.ack_mode;

        for (index, batch) in partition(bets, self.config.batch_max_amount).enumerate() {
            self.checkpoint()?;
            let number = index + 1;

            let expected = match mode {
                AckMode::LastNumber => match expected_last_number(batch) {
                    Ok(n) => Some(n),
                    Err(reason) => {
                        return Err(self.reject(number, batch.len(), reason, report.records_sent));
                    }
                },
                AckMode::Flag => None,
            };

            self.emit(SessionEvent::BatchSending {
                batch: number,
                size: batch.len(),
            });
            let reply = self
                .exchange(Request::Batch(batch), mode.reply_kind())
                .await
                .map_err(|e| e.during_batch(number, report.records_sent))?;

            let verdict = match (&reply, expected) {
                (Reply::Ack(acked), Some(expected)) => verify_ack(expected, *acked).map(Some),
                (Reply::Status(true), _) => Ok(None),
                (Reply::Status(false), _) => Err(Rejection::Refused),
                _ => return Err(unexpected_reply(Phase::Submitting, &reply)),
            };

            match verdict {
                Ok(last_number) => {
                    report.batches_sent += 1;
                    report.records_sent += batch.len();
                    self.emit(SessionEvent::BatchAccepted {
                        batch: number,
                        size: batch.len(),
                        last_number,
                        processed: report.records_sent,
                    });
                }
                Err(reason) => {
                    return Err(self.reject(number, batch.len(), reason, report.records_sent));
                }
            }
        }

        self.emit(SessionEvent::AllBetsSent {
            batches: report.batches_sent,
            records: report.records_sent,
        });
        Ok(())
    }

    fn reject(&self, batch: usize, size: usize, reason: Rejection, processed: usize) -> SessionError {
        self.emit(SessionEvent::BatchRejected {
            batch,
            size,
            reason: &reason,
            processed,
        });
        SessionError::BatchRejected {
            batch,
            acked_records: processed,
            reason,
        }
    }

    async fn finish(&mut self) -> Result<(), SessionError> {
        self.enter(Phase::Finishing);
        self.checkpoint()?;

        let agency = self.config.agency.clone();
        match self.exchange(Request::finish(&agency), ReplyKind::Status).await? {
            Reply::Status(true) => {
                self.emit(SessionEvent::FinishAccepted);
                Ok(())
            }
            Reply::Status(false) => {
                self.emit(SessionEvent::FinishRejected);
                Err(SessionError::FinishRejected)
            }
            other => Err(unexpected_reply(Phase::Finishing, &other)),
        }
    }

    async fn query_winners(&mut self) -> Result<(Vec<String>, u32), SessionError> {
        self.enter(Phase::QueryingWinners);
        let policy = self.config.winners_retry;
        let agency = self.config.agency.clone();

        for attempt in 1..=policy.max_attempts {
            self.checkpoint()?;
            match self.query_winners_once(&agency, attempt).await {
                Ok(winners) => {
                    self.emit(SessionEvent::WinnersReceived {
                        winners: &winners,
                        attempts: attempt,
                    });
                    return Ok((winners, attempt));
                }
                Err(SessionError::DrawPending) => {
                    self.emit(SessionEvent::WinnersWaiting {
                        attempt,
                        max_attempts: policy.max_attempts,
                    });
                    if attempt < policy.max_attempts {
                        self.pause(policy.delay).await?;
                    }
                }
                Err(error) => return Err(error),
            }
        }

        Err(SessionError::DrawQueryFailed {
            attempts: policy.max_attempts,
            reason: "draw still pending".to_string(),
        })
    }

    async fn query_winners_once(
        &mut self,
        agency: &str,
        attempt: u32,
    ) -> Result<Vec<String>, SessionError> {
        // A held connection may have been closed by the central after it
        // answered that the draw was pending.
        let may_reopen = attempt > 1 && !self.config.connection_per_batch;

        let reply = match self
            .exchange(Request::query_winners(agency), ReplyKind::Envelope)
            .await
        {
            Err(error) if may_reopen && error.is_connection_lost() => {
                tracing::debug!(agency, attempt, error = %error, "Connection lost between winners queries, reopening");
                self.exchange(Request::query_winners(agency), ReplyKind::Envelope)
                    .await?
            }
            other => other?,
        };

        let Reply::Envelope(payload) = reply else {
            return Err(unexpected_reply(Phase::QueryingWinners, &reply));
        };
        match decode_winners(&payload) {
            Ok(winners) => Ok(winners),
            Err(CodecError::DrawNotYetRun) => Err(SessionError::DrawPending),
            Err(e) => Err(SessionError::DrawQueryFailed {
                attempts: attempt,
                reason: e.to_string(),
            }),
        }
    }

    /// Send one request and wait for its reply. A failed exchange, or any
    /// exchange in per-batch mode, leaves the session without a connection.
    async fn exchange(&mut self, request: Request<'_>, kind: ReplyKind) -> Result<Reply, SessionError> {
        let phase = self.phase;
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.open().await?,
        };

        let result = match connection.send(request).await {
            Ok(()) => connection
                .receive(kind)
                .await
                .map_err(|source| SessionError::AckTimeoutOrTransportError {
                    phase,
                    progress: None,
                    source,
                }),
            Err(source) => Err(SessionError::SendFailed {
                phase,
                progress: None,
                source,
            }),
        };

        if result.is_err() || self.config.connection_per_batch {
            self.close(connection).await;
        } else {
            self.connection = Some(connection);
        }
        result
    }

    async fn open(&self) -> Result<Connection<C::Stream>, SessionError> {
        let target = self.connector.target();
        let stream = self
            .connector
            .connect()
            .await
            .map_err(|source| SessionError::ConnectFailed {
                target: target.clone(),
                source,
            })?;
        self.emit(SessionEvent::Connected { server: &target });
        Ok(Connection::new(stream).with_reply_timeout(self.config.reply_timeout))
    }

    async fn close(&self, connection: Connection<C::Stream>) {
        if let Err(e) = connection.close().await {
            tracing::debug!(error = %e, "Error while closing connection");
        }
        self.emit(SessionEvent::ConnectionClosed);
    }

    async fn pause(&self, delay: Duration) -> Result<(), SessionError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled { phase: self.phase }),
        }
    }

    fn checkpoint(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled { phase: self.phase });
        }
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(agency = %self.config.agency, from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
    }

    fn emit(&self, event: SessionEvent<'_>) {
        self.events.record(&self.config.agency, &event);
    }
}
