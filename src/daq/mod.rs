pub mod event;
pub mod session;
pub mod storage;

pub use event::{EventDecoder, EventRecord};
pub use session::{AcquisitionSession, IntegrityReport, RunRequest, RunSummary};
pub use storage::{AcquisitionKind, EventWriter};
