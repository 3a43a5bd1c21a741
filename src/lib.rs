//! Image Relocator Library
//!
//! Finds the container images referenced by a tree of deployment manifests,
//! saves each distinct image once into a local bundle, and later pushes the
//! bundle into another registry, reporting how every reference was rewritten.

pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod registry;
pub mod relocate;
pub mod scanner;
pub mod transfer;

pub use bundle::{ArchiveFormat, BundleEntry, BundleLayout, SeenSet};
pub use config::{AuthConfig, RelocatorConfig};
pub use error::{Direction, RelocatorError, Result};
pub use image::ImageReference;
pub use logging::Logger;
pub use registry::{CopyOptions, DistributionCopier, ImageCopier, TransportRef, TrustPolicy};
pub use relocate::{KustomizeImage, RelocatedImage, RelocationResult, Relocator, SaveSummary};
pub use scanner::{ManifestScanner, ScanReport, SkipReason, SkippedDocument};
pub use transfer::TransferEngine;
