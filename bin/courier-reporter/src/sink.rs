use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use courier_bulk::{BlackholeSender, CompressedBatch, SendError, Sender, WriterSender};
use tokio::io::Stdout;

/// Destination for flushed batches.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum SinkKind {
    /// Counts batches and discards them.
    #[default]
    Blackhole,

    /// Writes the compressed bytes of each batch to standard output.
    Stdout,
}

pub enum Sink {
    Blackhole(Arc<BlackholeSender>),
    Stdout(WriterSender<Stdout>),
}

impl Sink {
    pub fn from_kind(kind: SinkKind) -> Self {
        match kind {
            SinkKind::Blackhole => Self::Blackhole(Arc::new(BlackholeSender::default())),
            SinkKind::Stdout => Self::Stdout(WriterSender::new(tokio::io::stdout())),
        }
    }

    /// Returns the blackhole sender, if this is a blackhole sink.
    pub fn blackhole(&self) -> Option<Arc<BlackholeSender>> {
        match self {
            Self::Blackhole(sender) => Some(Arc::clone(sender)),
            Self::Stdout(_) => None,
        }
    }
}

#[async_trait]
impl Sender for Sink {
    async fn send(&self, batch: &CompressedBatch) -> Result<(), SendError> {
        match self {
            Self::Blackhole(sender) => sender.send(batch).await,
            Self::Stdout(sender) => sender.send(batch).await,
        }
    }
}
