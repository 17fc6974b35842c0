//! Chronological state: records extracted from source documents and the
//! paginated listings published from them.

pub mod extract;
pub mod publish;
pub mod record;

pub use extract::StateExtractor;
pub use publish::{PublishError, PublishReport, STATE_NS, StatePublisher, page_name};
pub use record::{Date, Entry, Fragment, RecordDraft, StateRecord, Tags};
