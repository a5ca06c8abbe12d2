use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::MarkerIoError;
use crate::eval::EvaluationResult;
use crate::queue::{CheckpointRef, CompletionLedger, EpochList};
use crate::timeline::MetricsSink;

#[derive(Debug)]
pub enum RecordOutcome {
    Committed(PathBuf),
    MetricsFailed {
        marker: PathBuf,
        error: anyhow::Error,
    },
    NotWriter,
    MarkerFailed(MarkerIoError),
}

// The writer-role check lives here and nowhere else.
pub struct ResultRecorder<'a> {
    ctx: &'a RunContext,
    ledger: CompletionLedger,
    sink: Option<Box<dyn MetricsSink + 'a>>,
    epoch_list: Option<EpochList>,
}

impl<'a> ResultRecorder<'a> {
    pub fn new(ctx: &'a RunContext, ledger: CompletionLedger) -> Self {
        ResultRecorder {
            ctx,
            ledger,
            sink: None,
            epoch_list: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink + 'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_epoch_list(mut self, epoch_list: EpochList) -> Self {
        self.epoch_list = Some(epoch_list);
        self
    }

    pub fn ledger(&self) -> &CompletionLedger {
        &self.ledger
    }

    pub fn epoch_list(&self) -> Option<&EpochList> {
        self.epoch_list.as_ref()
    }

    // The marker is the commit point; later timeline or list failures never undo it.
    pub fn record(
        &mut self,
        checkpoint: &CheckpointRef,
        result: &EvaluationResult,
    ) -> RecordOutcome {
        if !self.ctx.is_writer() {
            return RecordOutcome::NotWriter;
        }

        let marker = match self.ledger.record(&checkpoint.path, &result.marker_text()) {
            Ok(path) => path,
            Err(err) => return RecordOutcome::MarkerFailed(err),
        };
        info!(path = %marker.display(), epoch = %checkpoint.epoch, "wrote completion marker");

        if let Some(list) = &self.epoch_list {
            if let Err(err) = list.append(&checkpoint.epoch) {
                warn!(path = %list.path().display(), error = %err, "failed to update epoch list");
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            for (tag, value) in &result.metrics {
                if let Err(error) = sink.add_scalar(tag, *value, &checkpoint.epoch) {
                    return RecordOutcome::MetricsFailed { marker, error };
                }
            }
        }

        RecordOutcome::Committed(marker)
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.ctx.is_writer() {
            return Ok(());
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}
