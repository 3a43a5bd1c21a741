//! Registry transfer backend
//!
//! [`copy::ImageCopier`] is the narrow interface the rest of the crate copies
//! images through. The other modules implement it for Docker Registry HTTP
//! API v2 endpoints and docker-archive files.

pub mod auth;
pub mod client;
pub mod copy;
pub mod transport;

pub use crate::config::AuthConfig;
pub use auth::{Auth, Authorization, Challenge};
pub use client::{RegistryClient, RegistryClientBuilder};
pub use copy::{CopyOptions, DistributionCopier, ImageCopier, TrustPolicy};
pub use transport::TransportRef;
