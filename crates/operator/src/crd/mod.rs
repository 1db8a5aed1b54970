pub mod daemonjob;

pub use daemonjob::{DaemonJob, DaemonJobSpec, DaemonJobStatus};
