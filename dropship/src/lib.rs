//! Deployment service core: given parameters identifying a caller machine,
//! returns a content-addressed launcher manifest whose files are guaranteed to
//! have time-limited download URLs, optionally rewritten through a peer proxy
//! chosen from the caller's fleet.
//!
//! The HTTP transport, the concrete object-store client, and the concrete
//! vault client are external collaborators; this crate publishes the service
//! surface they drive ([`service::DeploymentService`]).

pub mod config;
pub mod errors;
pub mod manifest;
pub mod metrics_defs;
pub mod preprocess;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod testutils;
pub mod tokens;
pub mod topology;
pub mod upload;
