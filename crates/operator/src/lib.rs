pub mod config;
pub mod controllers;
pub mod crd;
pub mod kubernetes;
pub mod metrics;
pub mod server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// The API server rejected a write as invalid, e.g. a change to an
    /// immutable Job field.
    #[error("Invalid object: {0}")]
    Invalid(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Object is already controlled by {0}")]
    AlreadyOwned(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 422 || ae.reason == "Invalid" => {
                Error::Invalid(ae.message)
            }
            e => Error::Kubernetes(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
