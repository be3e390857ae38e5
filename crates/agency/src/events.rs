//! Session events - the phase-boundary log lines of a run.
//!
//! A session reports through an injected [`SessionEvents`] instead of a global
//! logger. [`LogEvents`] turns each event into a structured `tracing` event
//! carrying `action` and `result` fields.

use std::sync::Arc;

use crate::session::{Phase, Rejection, SessionError};

#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    Connected {
        server: &'a str,
    },
    BatchSending {
        batch: usize,
        size: usize,
    },
    BatchAccepted {
        batch: usize,
        size: usize,
        last_number: Option<u32>,
        processed: usize,
    },
    BatchRejected {
        batch: usize,
        size: usize,
        reason: &'a Rejection,
        processed: usize,
    },
    AllBetsSent {
        batches: usize,
        records: usize,
    },
    FinishAccepted,
    FinishRejected,
    WinnersWaiting {
        attempt: u32,
        max_attempts: u32,
    },
    WinnersReceived {
        winners: &'a [String],
        attempts: u32,
    },
    PhaseFailed {
        error: &'a SessionError,
    },
    Shutdown {
        phase: Phase,
    },
    ConnectionClosed,
}

impl SessionEvent<'_> {
    /// Short name, stable across releases.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::BatchSending { .. } => "batch_sending",
            Self::BatchAccepted { .. } => "batch_accepted",
            Self::BatchRejected { .. } => "batch_rejected",
            Self::AllBetsSent { .. } => "all_bets_sent",
            Self::FinishAccepted => "finish_accepted",
            Self::FinishRejected => "finish_rejected",
            Self::WinnersWaiting { .. } => "winners_waiting",
            Self::WinnersReceived { .. } => "winners_received",
            Self::PhaseFailed { .. } => "phase_failed",
            Self::Shutdown { .. } => "shutdown",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

/// Receives the events of a session.
pub trait SessionEvents: Send + Sync {
    fn record(&self, agency: &str, event: &SessionEvent<'_>);
}

impl<T: SessionEvents + ?Sized> SessionEvents for Arc<T> {
    fn record(&self, agency: &str, event: &SessionEvent<'_>) {
        (**self).record(agency, event)
    }
}

/// Writes session events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl SessionEvents for LogEvents {
    fn record(&self, agency: &str, event: &SessionEvent<'_>) {
        match *event {
            SessionEvent::Connected { server } => {
                tracing::info!(action = "connect", result = "success", agency, %server, "Connected to central");
            }
            SessionEvent::BatchSending { batch, size } => {
                tracing::debug!(action = "send_batch", result = "in_progress", agency, batch, size, "Sending batch");
            }
            SessionEvent::BatchAccepted {
                batch,
                size,
                last_number,
                processed,
            } => {
                tracing::info!(
                    action = "batch_sent",
                    result = "success",
                    agency,
                    batch,
                    size,
                    last_number,
                    processed,
                    "Batch acknowledged"
                );
            }
            SessionEvent::BatchRejected {
                batch,
                size,
                reason,
                processed,
            } => {
                // "partial" means earlier batches were stored.
                let result = if processed > 0 { "partial" } else { "fail" };
                tracing::error!(
                    action = "batch_sent",
                    result,
                    agency,
                    batch,
                    size,
                    processed,
                    %reason,
                    "Batch rejected"
                );
            }
            SessionEvent::AllBetsSent { batches, records } => {
                tracing::info!(action = "all_bets_sent", result = "success", agency, batches, records, "All bets sent");
            }
            SessionEvent::FinishAccepted => {
                tracing::info!(action = "finish_notification", result = "success", agency, "Central acknowledged finish");
            }
            SessionEvent::FinishRejected => {
                tracing::error!(action = "finish_notification", result = "fail", agency, "Central refused finish");
            }
            SessionEvent::WinnersWaiting {
                attempt,
                max_attempts,
            } => {
                tracing::info!(
                    action = "consulta_ganadores",
                    result = "waiting",
                    agency,
                    attempt,
                    max_attempts,
                    "Draw not run yet"
                );
            }
            SessionEvent::WinnersReceived { winners, attempts } => {
                tracing::info!(
                    action = "consulta_ganadores",
                    result = "success",
                    agency,
                    cant_ganadores = winners.len(),
                    attempts,
                    "Winners received"
                );
                if !winners.is_empty() {
                    tracing::debug!(agency, ?winners, "Winning documents");
                }
            }
            SessionEvent::PhaseFailed { error } => match error {
                SessionError::DrawQueryFailed { attempts, reason } => {
                    tracing::warn!(
                        action = "consulta_ganadores",
                        result = "fail",
                        agency,
                        attempts,
                        %reason,
                        "Giving up on winners query"
                    );
                }
                other => {
                    let result = if other.is_partial() { "partial" } else { "fail" };
                    tracing::error!(
                        action = other.phase().action(),
                        result,
                        agency,
                        error = %other,
                        "Session failed"
                    );
                }
            },
            SessionEvent::Shutdown { phase } => {
                tracing::info!(action = "shutdown", result = "success", agency, %phase, "Shutdown requested");
            }
            SessionEvent::ConnectionClosed => {
                tracing::debug!(action = "close_connection", result = "success", agency, "Connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Names(Mutex<Vec<&'static str>>);

    impl SessionEvents for Names {
        fn record(&self, _agency: &str, event: &SessionEvent<'_>) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    #[test]
    fn arc_forwards_to_inner() {
        let names = Arc::new(Names::default());
        let shared: Arc<dyn SessionEvents> = names.clone();

        shared.record("1", &SessionEvent::FinishAccepted);
        shared.record("1", &SessionEvent::ConnectionClosed);

        assert_eq!(
            *names.0.lock().unwrap(),
            ["finish_accepted", "connection_closed"]
        );
    }

    #[test]
    fn log_events_accepts_every_event() {
        let reason = Rejection::Mismatch {
            expected: 3,
            acked: 2,
        };
        let error = SessionError::DrawQueryFailed {
            attempts: 3,
            reason: "draw still pending".to_string(),
        };
        let winners = vec!["111".to_string()];
        let events = [
            SessionEvent::Connected { server: "central:12345" },
            SessionEvent::BatchSending { batch: 1, size: 2 },
            SessionEvent::BatchRejected {
                batch: 2,
                size: 1,
                reason: &reason,
                processed: 2,
            },
            SessionEvent::WinnersReceived {
                winners: &winners,
                attempts: 1,
            },
            SessionEvent::PhaseFailed { error: &error },
            SessionEvent::Shutdown {
                phase: Phase::Submitting,
            },
        ];

        for event in &events {
            LogEvents.record("1", event);
        }
    }
}
