pub mod daemonjob;

pub use daemonjob::{daemon_job_keys, DaemonJobController, NamespacedName, Outcome};
