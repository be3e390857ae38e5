//! Session runs against a scripted central over loopback TCP.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agency::wire::protocol::Submission;
use agency::{
    AckMode, BatchProgress, Bet, CodecError, Phase, Rejection, RetryPolicy, Session,
    SessionConfig, SessionError, SessionEvent, SessionEvents, TcpConnector,
};
use common::{AckBehavior, FakeCentral, Script};
use tokio_util::sync::CancellationToken;

fn bets(n: u32) -> Vec<Bet> {
    (1..=n)
        .map(|i| {
            Bet::new(
                "1",
                "Santiago Lionel",
                "Lorca",
                (30904464 + i).to_string(),
                "1999-03-17",
                i.to_string(),
            )
        })
        .collect()
}

fn config() -> SessionConfig {
    SessionConfig::new("1")
        .with_batch_max_amount(2)
        .with_winners_retry(RetryPolicy::new(3, Duration::from_millis(10)))
        .with_reply_timeout(Some(Duration::from_secs(5)))
}

fn session(central: &FakeCentral, config: SessionConfig) -> Session<TcpConnector> {
    Session::new(config, TcpConnector::new(central.address()))
}

fn control(submissions: &[Submission]) -> Vec<Submission> {
    submissions
        .iter()
        .filter(|s| !matches!(s, Submission::Bets(_)))
        .cloned()
        .collect()
}

#[derive(Default)]
struct Recorder(Mutex<Vec<&'static str>>);

impl Recorder {
    fn names(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

impl SessionEvents for Recorder {
    fn record(&self, agency: &str, event: &SessionEvent<'_>) {
        assert_eq!(agency, "1");
        self.0.lock().unwrap().push(event.name());
    }
}

/// Requests shutdown as soon as the first batch is acknowledged.
struct CancelAfterFirstBatch(CancellationToken);

impl SessionEvents for CancelAfterFirstBatch {
    fn record(&self, _agency: &str, event: &SessionEvent<'_>) {
        if let SessionEvent::BatchAccepted { batch: 1, .. } = event {
            self.0.cancel();
        }
    }
}

#[tokio::test]
async fn full_run_submits_every_bet_and_reports_winners() {
    let central = FakeCentral::start(Script {
        winners: vec!["30904465".to_string(), "30904467".to_string()],
        ..Script::default()
    })
    .await;
    let input = bets(5);

    let report = session(&central, config()).run(&input).await.unwrap();

    assert_eq!(report.agency, "1");
    assert_eq!(report.batches_sent, 3);
    assert_eq!(report.records_sent, 5);
    assert_eq!(report.winners, ["30904465", "30904467"]);
    assert_eq!(report.winners_attempts, 1);

    assert_eq!(central.batches(), 3);
    assert_eq!(central.bets(), input);
    assert_eq!(
        control(&central.submissions()),
        [
            Submission::Finish {
                agency: "1".to_string()
            },
            Submission::QueryWinners {
                agency: "1".to_string()
            },
        ]
    );
    assert_eq!(central.connections(), 1);
}

#[tokio::test]
async fn mismatched_ack_stops_after_partial_submission() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Fixed(vec![2, 2]),
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(3)).await.unwrap_err();

    match &err {
        SessionError::BatchRejected {
            batch,
            acked_records,
            reason,
        } => {
            assert_eq!(*batch, 2);
            assert_eq!(*acked_records, 2);
            assert_eq!(
                *reason,
                Rejection::Mismatch {
                    expected: 3,
                    acked: 2
                }
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_partial());
    assert_eq!(central.batches(), 2);
    assert!(control(&central.submissions()).is_empty());
}

#[tokio::test]
async fn zero_ack_on_first_batch_is_total_failure() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Fixed(vec![0]),
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(4)).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::BatchRejected {
            batch: 1,
            acked_records: 0,
            reason: Rejection::NothingProcessed,
        }
    ));
    assert!(!err.is_partial());
    assert_eq!(central.batches(), 1);
}

#[tokio::test]
async fn unparsable_bet_number_is_rejected_before_sending() {
    let central = FakeCentral::start(Script::default()).await;
    let input = [Bet::new("1", "Ana", "Gomez", "30904465", "1999-03-17", "abc")];

    let err = session(&central, config()).run(&input).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::BatchRejected {
            batch: 1,
            reason: Rejection::UnparsableNumber(_),
            ..
        }
    ));
    assert!(central.submissions().is_empty());
}

#[tokio::test]
async fn flag_ack_refusal_rejects_batch() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Flags(vec![true, false]),
        ..Script::default()
    })
    .await;
    let config = config().with_ack_mode(AckMode::Flag);

    let err = session(&central, config).run(&bets(3)).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::BatchRejected {
            batch: 2,
            acked_records: 2,
            reason: Rejection::Refused,
        }
    ));
    assert!(err.is_partial());
}

#[tokio::test]
async fn flag_ack_mode_completes_run() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Flags(Vec::new()),
        winners: vec!["30904466".to_string()],
        ..Script::default()
    })
    .await;
    let config = config().with_ack_mode(AckMode::Flag);

    let report = session(&central, config).run(&bets(3)).await.unwrap();

    assert_eq!(report.batches_sent, 2);
    assert_eq!(report.winners, ["30904466"]);
}

#[tokio::test]
async fn empty_input_goes_straight_to_finish() {
    let central = FakeCentral::start(Script::default()).await;

    let report = session(&central, config()).run(&[]).await.unwrap();

    assert_eq!(report.batches_sent, 0);
    assert_eq!(report.records_sent, 0);
    assert!(report.winners.is_empty());
    assert_eq!(central.batches(), 0);
    assert_eq!(central.submissions().len(), 2);
}

#[tokio::test]
async fn finish_refusal_skips_winners_query() {
    let central = FakeCentral::start(Script {
        finish_ok: false,
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(2)).await.unwrap_err();

    assert!(matches!(err, SessionError::FinishRejected));
    assert_eq!(err.phase(), Phase::Finishing);
    assert_eq!(central.queries(), 0);
}

#[tokio::test]
async fn pending_draw_exhausts_retry_budget() {
    let central = FakeCentral::start(Script {
        pending_replies: 100,
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(1)).await.unwrap_err();

    assert!(matches!(err, SessionError::DrawQueryFailed { attempts: 3, .. }));
    assert_eq!(err.phase(), Phase::QueryingWinners);
    assert_eq!(central.queries(), 3);
}

#[tokio::test]
async fn pending_draw_then_winners() {
    let central = FakeCentral::start(Script {
        pending_replies: 2,
        winners: vec!["30904465".to_string()],
        ..Script::default()
    })
    .await;

    let report = session(&central, config()).run(&bets(1)).await.unwrap();

    assert_eq!(report.winners, ["30904465"]);
    assert_eq!(report.winners_attempts, 3);
    assert_eq!(central.queries(), 3);
}

#[tokio::test]
async fn no_winners_is_success() {
    let central = FakeCentral::start(Script::default()).await;

    let report = session(&central, config()).run(&bets(1)).await.unwrap();

    assert!(report.winners.is_empty());
    assert_eq!(report.winners_attempts, 1);
}

#[tokio::test]
async fn held_connection_is_reopened_when_central_closes_it() {
    let central = FakeCentral::start(Script {
        pending_replies: 1,
        close_after_pending: true,
        winners: vec!["30904465".to_string()],
        ..Script::default()
    })
    .await;

    let report = session(&central, config()).run(&bets(2)).await.unwrap();

    assert_eq!(report.winners, ["30904465"]);
    assert_eq!(report.winners_attempts, 2);
    assert_eq!(central.connections(), 2);
}

#[tokio::test]
async fn per_batch_mode_opens_a_connection_per_exchange() {
    let central = FakeCentral::start(Script::default()).await;
    let config = config().with_connection_per_batch(true);

    let report = session(&central, config).run(&bets(4)).await.unwrap();

    assert_eq!(report.batches_sent, 2);
    // Two batches, the finish notification and one winners query.
    assert_eq!(central.connections(), 4);
}

#[tokio::test]
async fn central_hangup_is_a_transport_error() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Hangup,
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(2)).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::AckTimeoutOrTransportError {
            phase: Phase::Submitting,
            ..
        }
    ));
}

#[tokio::test]
async fn silent_central_hits_reply_timeout() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Silent,
        ..Script::default()
    })
    .await;
    let config = config().with_reply_timeout(Some(Duration::from_millis(50)));

    let err = session(&central, config).run(&bets(2)).await.unwrap_err();

    match err {
        SessionError::AckTimeoutOrTransportError {
            phase: Phase::Submitting,
            source: CodecError::Io(e),
            ..
        } => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn refused_connection_fails_in_connecting_phase() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = Session::new(config(), TcpConnector::new(addr.to_string()));
    let err = session.run(&bets(1)).await.unwrap_err();

    assert!(matches!(err, SessionError::ConnectFailed { .. }));
    assert_eq!(err.phase(), Phase::Connecting);
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let central = FakeCentral::start(Script::default()).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = session(&central, config())
        .with_cancellation(token)
        .run(&bets(3))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Cancelled {
            phase: Phase::Connecting
        }
    ));
    assert_eq!(central.connections(), 0);
}

#[tokio::test]
async fn cancel_interrupts_retry_delay() {
    let central = FakeCentral::start(Script {
        pending_replies: 100,
        ..Script::default()
    })
    .await;
    let config = config().with_winners_retry(RetryPolicy::new(5, Duration::from_secs(30)));
    let token = CancellationToken::new();
    let input = bets(1);

    let run = session(&central, config)
        .with_cancellation(token.clone())
        .run(&input);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancellation should end the retry delay")
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Cancelled {
            phase: Phase::QueryingWinners
        }
    ));
    assert_eq!(central.queries(), 1);
}

#[tokio::test]
async fn events_follow_phase_boundaries() {
    let central = FakeCentral::start(Script::default()).await;
    let recorder = Arc::new(Recorder::default());

    Session::with_events(
        config(),
        TcpConnector::new(central.address()),
        recorder.clone(),
    )
    .run(&bets(2))
    .await
    .unwrap();

    assert_eq!(
        recorder.names(),
        [
            "connected",
            "batch_sending",
            "batch_accepted",
            "all_bets_sent",
            "finish_accepted",
            "winners_received",
            "connection_closed",
        ]
    );
}

#[tokio::test]
async fn events_for_rejected_batch() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::Fixed(vec![2, 7]),
        ..Script::default()
    })
    .await;
    let recorder = Arc::new(Recorder::default());

    let result = Session::with_events(
        config(),
        TcpConnector::new(central.address()),
        recorder.clone(),
    )
    .run(&bets(4))
    .await;

    assert!(result.is_err());
    assert_eq!(
        recorder.names(),
        [
            "connected",
            "batch_sending",
            "batch_accepted",
            "batch_sending",
            "batch_rejected",
            "connection_closed",
        ]
    );
}

#[tokio::test]
async fn unencodable_batch_fails_to_send_and_closes_connection() {
    let central = FakeCentral::start(Script::default()).await;
    let recorder = Arc::new(Recorder::default());
    let mut input = bets(2);
    input.push(Bet::new("1", "Ana|Maria", "Gomez", "30904467", "1999-03-17", "3"));

    let err = Session::with_events(
        config(),
        TcpConnector::new(central.address()),
        recorder.clone(),
    )
    .run(&input)
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        SessionError::SendFailed {
            phase: Phase::Submitting,
            progress: Some(BatchProgress {
                batch: 2,
                acked_records: 2,
            }),
            source: CodecError::DelimiterInField {
                field: "first_name"
            },
        }
    ));
    assert!(err.is_partial());
    assert_eq!(central.batches(), 1);
    assert!(control(&central.submissions()).is_empty());
    assert_eq!(
        recorder.names(),
        [
            "connected",
            "batch_sending",
            "batch_accepted",
            "batch_sending",
            "connection_closed",
            "phase_failed",
        ]
    );
}

#[tokio::test]
async fn hangup_mid_submission_keeps_batch_progress() {
    let central = FakeCentral::start(Script {
        ack: AckBehavior::HangupAt(1),
        ..Script::default()
    })
    .await;

    let err = session(&central, config()).run(&bets(4)).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::AckTimeoutOrTransportError {
            phase: Phase::Submitting,
            progress: Some(BatchProgress {
                batch: 2,
                acked_records: 2,
            }),
            ..
        }
    ));
    assert!(err.is_partial());
    assert_eq!(central.batches(), 2);
    assert!(control(&central.submissions()).is_empty());
}

#[tokio::test]
async fn cancel_at_batch_boundary_stops_submission() {
    let central = FakeCentral::start(Script::default()).await;
    let token = CancellationToken::new();

    let err = Session::with_events(
        config(),
        TcpConnector::new(central.address()),
        CancelAfterFirstBatch(token.clone()),
    )
    .with_cancellation(token)
    .run(&bets(4))
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Cancelled {
            phase: Phase::Submitting
        }
    ));
    assert_eq!(central.batches(), 1);
    assert!(control(&central.submissions()).is_empty());
}
