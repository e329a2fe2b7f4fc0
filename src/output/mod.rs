//! Reporting
//!
//! The reporter interface the dispatcher drives, a console reporter and the
//! run summary.

mod formatter;
mod reporter;
mod summary;

pub use formatter::{LineReporter, OutputFormat};
pub use reporter::{CollectingReporter, ReportedEvent, Reporter};
pub use summary::{RunStatus, RunSummary};
