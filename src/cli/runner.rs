//! Runs a parsed command against the library

use crate::cli::args::{Args, Command, OutputFormat};
use crate::config::{AuthConfig, RelocatorConfig};
use crate::error::{RelocatorError, Result};
use crate::logging::Logger;
use crate::registry::copy::{DistributionCopier, ImageCopier};
use crate::relocate::{KustomizeImage, RelocationResult, Relocator};
use crate::scanner::ManifestScanner;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Mapping document written after `push`
#[derive(Debug, Serialize)]
struct ImageMapping {
    images: Vec<KustomizeImage>,
}

pub struct Runner {
    args: Args,
    config: RelocatorConfig,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Result<Self> {
        args.validate().map_err(RelocatorError::Configuration)?;

        let output = if args.global.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.global.verbose)
        };
        // Image lists and mappings printed to stdout must stay parseable.
        let output = if args.writes_results_to_stdout() {
            output.with_stderr()
        } else {
            output
        };

        let config = Self::build_config(&args)?;
        Ok(Self {
            args,
            config,
            output,
        })
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    /// File, then environment, then flags
    fn build_config(args: &Args) -> Result<RelocatorConfig> {
        let mut config = match &args.global.config {
            Some(path) => RelocatorConfig::load(path)?,
            None => RelocatorConfig::default(),
        };
        config.apply_env(args.destination_registry())?;

        if args.global.skip_tls {
            config.transfer.skip_tls = true;
        }
        if let Some(concurrency) = args.global.concurrency {
            config.transfer.concurrency = concurrency;
        }

        match &args.command {
            Command::Save { skip_existing, .. } => {
                config.bundle.skip_existing |= *skip_existing;
            }
            Command::Push {
                registry,
                plain_http,
                ..
            } => {
                if *plain_http && !config.transfer.is_plain_http(registry) {
                    config.transfer.plain_http.push(registry.clone());
                }
                if let Some(username) = &args.global.username {
                    let password = args.global.password.clone().unwrap_or_default();
                    config
                        .auth
                        .insert(registry.clone(), AuthConfig::new(username.clone(), password));
                }
            }
            Command::Images { .. } => {}
        }

        config.validate()?;
        Ok(config)
    }

    pub async fn run(&self) -> Result<()> {
        match &self.args.command {
            Command::Images { manifest_dir } => self.list_images(manifest_dir),
            Command::Save { manifest_dir, bundle, .. } => self.save(manifest_dir, bundle).await,
            Command::Push {
                bundle,
                registry,
                namespace,
                output,
                format,
                ..
            } => {
                let result = self.push(bundle, registry, namespace).await?;
                self.write_mapping(&result, output.as_deref(), *format)
            }
        }
    }

    fn list_images(&self, manifest_dir: &Path) -> Result<()> {
        let report = ManifestScanner::new().scan(manifest_dir)?;
        for skipped in &report.skipped {
            self.output.detail(&format!(
                "Skipped {} (document {}): {}",
                skipped.file.display(),
                skipped.index,
                skipped.reason
            ));
        }
        for image in report.unique_images() {
            println!("{}", image);
        }
        Ok(())
    }

    async fn save(&self, manifest_dir: &Path, bundle: &Path) -> Result<()> {
        let summary = self.relocator(bundle).save_images(manifest_dir).await?;
        self.output.summary_kv(
            "Save summary",
            &[
                ("Saved", summary.saved.len().to_string()),
                ("Already bundled", summary.skipped_existing.to_string()),
                ("Skipped documents", summary.scan.skipped.len().to_string()),
                ("Elapsed", self.output.format_duration(self.output.elapsed())),
            ],
        );
        Ok(())
    }

    async fn push(&self, bundle: &Path, registry: &str, namespace: &str) -> Result<RelocationResult> {
        let result = self.relocator(bundle).relocate(registry, namespace).await?;
        self.output.summary(
            "Relocated images",
            &result
                .images
                .iter()
                .map(|image| format!("{} -> {}", image.original, image.rewritten))
                .collect::<Vec<_>>(),
        );
        Ok(result)
    }

    fn relocator(&self, bundle: &Path) -> Relocator {
        let copier: Arc<dyn ImageCopier> = Arc::new(DistributionCopier::new(
            self.config.transfer.clone(),
            self.config.auth.clone(),
        ));
        Relocator::from_config(bundle, &self.config, copier, self.output.clone())
    }

    fn write_mapping(
        &self,
        result: &RelocationResult,
        destination: Option<&Path>,
        format: OutputFormat,
    ) -> Result<()> {
        let rendered = render_mapping(result, format)?;
        match destination {
            Some(path) => {
                std::fs::write(path, rendered).map_err(|e| RelocatorError::path(path, e))?;
                self.output
                    .success(&format!("Image mapping written to {}", path.display()));
            }
            None => print!("{}", rendered),
        }
        Ok(())
    }
}

/// `images:` document in the requested format
fn render_mapping(result: &RelocationResult, format: OutputFormat) -> Result<String> {
    let mapping = ImageMapping {
        images: result.to_kustomize_images(),
    };
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(&mapping)?,
        OutputFormat::Json => serde_json::to_string_pretty(&mapping)? + "\n",
    })
}
