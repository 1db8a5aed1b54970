pub mod client;
pub mod job;
pub mod owner;

pub use client::{KubePlatformClient, PlatformClient};
pub use job::{build_job, converge_job, job_name, node_selector};
pub use owner::set_controller_owner;
