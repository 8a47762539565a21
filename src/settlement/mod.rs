// Shift settlement - earning credits for verified shifts and backing them with
// donations, synchronously and through reconciliation
pub mod earn_shift;
pub mod reconciler;
pub mod scheduler;

pub use earn_shift::{EarnShiftFunder, FundingOutcome, FundingResult, SkipReason, VerifiedShift};
pub use reconciler::{ReconcileJob, Reconciler, RunOptions, RunSummary};
pub use scheduler::{ReconcileFrequency, ReconcileScheduleConfig, ReconcileScheduler};
