//! Scripted central server for session integration tests.
//!
//! Speaks the central side of the protocol over loopback TCP and records
//! everything it receives.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use agency::wire::codec::CentralCodec;
use agency::wire::protocol::{Bet, CentralReply, Submission, Winners};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::Framed;

/// How the central answers batches.
#[derive(Debug, Clone, Default)]
pub enum AckBehavior {
    /// Ack the number of the batch's last bet.
    #[default]
    LastNumber,
    /// Ack these numbers, one per batch in arrival order; later batches
    /// fall back to the last bet's number.
    Fixed(Vec<u32>),
    /// Reply with a 1-byte flag per batch; missing entries accept.
    Flags(Vec<bool>),
    /// Drop the connection instead of answering.
    Hangup,
    /// Ack the last bet's number until the batch with this 0-based index
    /// arrives, then drop the connection.
    HangupAt(usize),
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub ack: AckBehavior,
    pub finish_ok: bool,
    /// Number of winners queries answered with the draw-pending sentinel.
    pub pending_replies: usize,
    /// Close the connection after every draw-pending reply.
    pub close_after_pending: bool,
    pub winners: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            ack: AckBehavior::default(),
            finish_ok: true,
            pending_replies: 0,
            close_after_pending: false,
            winners: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    submissions: Vec<Submission>,
    connections: usize,
    batches: usize,
    queries: usize,
}

pub struct FakeCentral {
    pub addr: SocketAddr,
    record: Arc<Mutex<Record>>,
    shutdown: Arc<Notify>,
}

impl FakeCentral {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let record = Arc::new(Mutex::new(Record::default()));
        let shutdown = Arc::new(Notify::new());

        let script = Arc::new(script);
        let accept_record = record.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        accept_record.lock().unwrap().connections += 1;
                        let script = script.clone();
                        let record = accept_record.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, &script, &record).await;
                        });
                    }
                    _ = accept_shutdown.notified() => break,
                }
            }
        });

        Self {
            addr,
            record,
            shutdown,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.record.lock().unwrap().submissions.clone()
    }

    /// Bets received across all batches, in arrival order.
    pub fn bets(&self) -> Vec<Bet> {
        self.submissions()
            .into_iter()
            .filter_map(|s| match s {
                Submission::Bets(bets) => Some(bets),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn batches(&self) -> usize {
        self.record.lock().unwrap().batches
    }

    pub fn connections(&self) -> usize {
        self.record.lock().unwrap().connections
    }

    pub fn queries(&self) -> usize {
        self.record.lock().unwrap().queries
    }
}

impl Drop for FakeCentral {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn handle_connection(stream: TcpStream, script: &Script, record: &Mutex<Record>) {
    let mut framed = Framed::new(stream, CentralCodec::new());

    while let Some(Ok(submission)) = framed.next().await {
        let reply = {
            let mut record = record.lock().unwrap();
            record.submissions.push(submission.clone());
            match submission {
                Submission::Bets(bets) => {
                    let index = record.batches;
                    record.batches += 1;
                    let last = bets.last().and_then(Bet::number_value).unwrap_or(0);
                    match &script.ack {
                        AckBehavior::LastNumber => Some(CentralReply::Ack(last)),
                        AckBehavior::Fixed(acks) => {
                            Some(CentralReply::Ack(acks.get(index).copied().unwrap_or(last)))
                        }
                        AckBehavior::Flags(flags) => Some(CentralReply::Status(
                            flags.get(index).copied().unwrap_or(true),
                        )),
                        AckBehavior::Hangup => return,
                        AckBehavior::HangupAt(at) if index >= *at => return,
                        AckBehavior::HangupAt(_) => Some(CentralReply::Ack(last)),
                        AckBehavior::Silent => None,
                    }
                }
                Submission::Finish { .. } => Some(CentralReply::Status(script.finish_ok)),
                Submission::QueryWinners { .. } => {
                    record.queries += 1;
                    if record.queries <= script.pending_replies {
                        Some(CentralReply::Winners(Winners::DrawPending))
                    } else {
                        Some(CentralReply::Winners(Winners::Documents(
                            script.winners.clone(),
                        )))
                    }
                }
            }
        };

        let Some(reply) = reply else { continue };
        let pending = reply == CentralReply::Winners(Winners::DrawPending);
        if framed.send(reply).await.is_err() {
            return;
        }
        if pending && script.close_after_pending {
            return;
        }
    }
}
