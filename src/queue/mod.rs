mod epoch_list;
mod ledger;
mod scanner;

pub use epoch_list::{EpochList, RecordedEpochs};
pub use ledger::CompletionLedger;
pub use scanner::{CheckpointPattern, CheckpointRef, CheckpointSource, DirectoryScanner, EpochId};
