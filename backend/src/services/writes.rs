use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::error::{AppError, AppResult};
use crate::services::notices::NoticeBoard;
use crate::services::realtime::RealtimeStore;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { path: String, value: Value },
    Update { path: String, children: Map<String, Value> },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Update { path, .. } => path,
        }
    }
}

enum Command {
    Write {
        op: WriteOp,
        done: Option<oneshot::Sender<AppResult<()>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Serializes real-time store writes on one task so they are issued in
/// program order. Callers either fire and forget (failures become notices)
/// or wait for the acknowledgement.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl WriteQueue {
    /// Start the writer task. It exits once every handle is dropped.
    pub fn spawn(store: Arc<dyn RealtimeStore>, notices: NoticeBoard) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Write { op, done } => {
                        let result = apply(store.as_ref(), &op).await;
                        match done {
                            Some(done) => {
                                let _ = done.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    tracing::warn!("Write to {} failed: {}", op.path(), e);
                                    notices.error("backend.write_failed", &[("err", &e.to_string())]);
                                }
                            }
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("Write queue closed");
        });

        Self { tx }
    }

    /// Issue a write without waiting for it.
    pub fn submit(&self, op: WriteOp) {
        let path = op.path().to_string();
        if self.tx.send(Command::Write { op, done: None }).is_err() {
            tracing::warn!("Write queue is closed; dropping write to {}", path);
        }
    }

    /// Issue a write and wait for the backend's answer.
    pub async fn submit_and_wait(&self, op: WriteOp) -> AppResult<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Write {
                op,
                done: Some(done),
            })
            .map_err(|_| AppError::ServiceUnavailable("write queue is closed".to_string()))?;

        rx.await
            .map_err(|_| AppError::ServiceUnavailable("write queue is closed".to_string()))?
    }

    /// Wait until every write submitted before this call has been attempted.
    pub async fn flush(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn apply(store: &dyn RealtimeStore, op: &WriteOp) -> AppResult<()> {
    match op {
        WriteOp::Set { path, value } => store.set(path, value.clone()).await,
        WriteOp::Update { path, children } => store.update(path, children.clone()).await,
    }
}
