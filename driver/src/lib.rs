//! Automation driver: dependency-closure method submission against the
//! execution daemon, and the reproducibility ledger client.

pub mod automation;
pub mod daemon;
pub mod joblist;
pub mod urd;

pub use automation::{Automation, CallMethodRequest, Monitor, NameRef, NullMonitor, RecordAs, Verbosity};
pub use daemon::{DaemonClient, DaemonError, MethodInfo, SubmitRequest, SubmitResponse, SubmittedJob};
pub use joblist::{JobList, JobRef, Record};
pub use urd::{BuildError, UrdClient, UrdError, UrdResponse};
