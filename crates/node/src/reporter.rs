//! Outbound report queue.
//!
//! The control loop hands reports to [`Reporter::report`], which never
//! blocks: a full queue drops the new report. [`drain`] posts them one at a
//! time. Delivery is at-most-once; a failed post is logged and discarded.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::client::{AckReport, ClientError, ReadingReport};
use crate::session::Session;

pub const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Ack(AckReport),
    Reading(ReadingReport),
}

impl Outbound {
    fn kind(&self) -> &'static str {
        match self {
            Self::Ack(_) => "ack",
            Self::Reading(_) => "reading",
        }
    }
}

#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Outbound>,
}

pub fn channel(depth: usize) -> (Reporter, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(depth);
    (Reporter { tx }, rx)
}

impl Reporter {
    /// Returns false when the report was dropped.
    pub fn report(&self, msg: Outbound) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(kind = msg.kind(), "report queue full; dropping report");
                false
            }
            Err(TrySendError::Closed(msg)) => {
                warn!(kind = msg.kind(), "report drain stopped; dropping report");
                false
            }
        }
    }
}

pub async fn drain(mut rx: mpsc::Receiver<Outbound>, session: Arc<Session>) {
    while let Some(msg) = rx.recv().await {
        let key = session.api_key().await;
        let res = match &msg {
            Outbound::Ack(ack) => session.client().post_ack(&key, ack).await,
            Outbound::Reading(r) => session.client().post_reading(&key, r).await,
        };

        match res {
            Ok(()) => debug!(kind = msg.kind(), "report delivered"),
            Err(ClientError::Unauthorized) => {
                warn!(kind = msg.kind(), "report rejected; re-provisioning");
                if let Err(e) = session.reprovision(&key).await {
                    warn!("re-provisioning failed: {e}");
                }
            }
            Err(e) => warn!(kind = msg.kind(), "report failed: {e}"),
        }
    }
}
