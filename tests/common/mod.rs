//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image_relocator::registry::{CopyOptions, ImageCopier, TransportRef};
use image_relocator::{Logger, RelocatorConfig, RelocatorError, Relocator, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stands in for a registry: saves write a small archive file, pushes are recorded
#[derive(Default)]
pub struct RecordingCopier {
    /// Every copy as `(source, destination)`, recorded when it starts
    pub started: Mutex<Vec<(String, String)>>,
    /// Copies that ran to completion
    pub completed: Mutex<Vec<(String, String)>>,
    /// Destinations whose copy fails
    pub fail_destinations: HashSet<String>,
    /// Delay before a successful copy completes
    pub delay: Option<Duration>,
}

impl RecordingCopier {
    pub fn failing(destinations: &[&str]) -> Self {
        Self {
            fail_destinations: destinations.iter().map(|d| d.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<(String, String)> {
        self.completed.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.started()
            .into_iter()
            .filter(|(source, _)| source.starts_with("docker://"))
            .map(|(source, _)| source)
            .collect()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.started()
            .into_iter()
            .filter(|(_, destination)| destination.starts_with("docker://"))
            .map(|(_, destination)| destination)
            .collect()
    }
}

#[async_trait]
impl ImageCopier for RecordingCopier {
    async fn copy(
        &self,
        source: &TransportRef,
        destination: &TransportRef,
        options: &CopyOptions,
    ) -> Result<()> {
        options.trust_policy.check(source)?;
        let record = (source.to_string(), destination.to_string());
        self.started.lock().unwrap().push(record.clone());

        if self.fail_destinations.contains(&record.1) {
            return Err(RelocatorError::Registry(format!(
                "denied: requested access to {} is denied",
                record.1
            )));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let TransportRef::DockerArchive(path) = destination {
            fs::write(path, &record.0)?;
        }

        self.completed.lock().unwrap().push(record);
        Ok(())
    }
}

pub fn relocator(bundle: &Path, copier: Arc<RecordingCopier>) -> Relocator {
    Relocator::from_config(bundle, &RelocatorConfig::default(), copier, Logger::new_quiet())
}

/// Write a Deployment manifest referencing `images`
pub fn write_deployment(path: &Path, images: &[&str]) {
    let containers: String = images
        .iter()
        .enumerate()
        .map(|(i, image)| format!("        - name: c{}\n          image: {}\n", i, image))
        .collect();
    let manifest = format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n  template:\n    spec:\n      containers:\n{}",
        containers
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, manifest).unwrap();
}

/// Place an archive file for `segments` under the bundle's docker-archive directory
pub fn write_bundle_entry(bundle: &Path, segments: &[&str]) {
    let mut path = bundle.join("docker-archive");
    path.extend(segments);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"archive").unwrap();
}
