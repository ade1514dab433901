//! End-to-end conversion pipeline.
//!
//! `Converter` drives one image through every phase:
//!
//! ```text
//! Resolve ─▶ Download ─▶ Assemble ─▶ Plan ─▶ Partition ─▶ Format ─▶ Populate ─▶ Bootloader ─▶ Finalize
//!  (async, network)        (blocking pool)   (blocking pool, one DiskImageBuilder)
//! ```
//!
//! Every resource acquired along the way is registered with a per-conversion
//! `ResourceTracker`, which is unwound exactly once when the pipeline returns,
//! whatever the outcome.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use dockboot_core::config::ConvertConfig;
use dockboot_core::error::{ConversionFailure, ConvertError, Result};
use dockboot_core::event::{Phase, ProgressReporter};

use crate::disk::{DiskBackend, DiskImage, DiskImageBuilder, DiskLayout, HostBackend};
use crate::oci::layers::{self, AssembledRoot};
use crate::oci::{ImageReference, LayerDescriptor, Manifest, Platform, RegistryAuth, RegistryClient, RegistryTransport};
use crate::tracker::ResourceTracker;
use crate::workspace::Workspace;

/// What to convert and where to put it.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Image reference as typed by the user; parsed during `Resolve`.
    pub reference: String,
    pub platform: Platform,
    pub auth: RegistryAuth,
    /// Requested disk size; rounded to whole sectors.
    pub size_bytes: u64,
    pub output: PathBuf,
}

impl ConversionRequest {
    pub fn new(reference: impl Into<String>, size_bytes: u64, output: impl Into<PathBuf>) -> Self {
        Self {
            reference: reference.into(),
            platform: Platform::default(),
            auth: RegistryAuth::anonymous(),
            size_bytes,
            output: output.into(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    pub image_path: PathBuf,
    pub size_bytes: u64,
    pub reference: String,
    pub manifest_digest: String,
    pub layers: usize,
    /// Kernel path inside the image, relative to the partition holding it.
    pub kernel: Option<PathBuf>,
    /// True when the generic boot stage was used instead of a distro kernel.
    pub generic_boot: bool,
    /// Set when `preserve_workspace` kept the scratch directory.
    pub workspace: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ConversionOutput {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

type PhaseResult<T> = std::result::Result<T, (Phase, ConvertError)>;

trait AtPhase<T> {
    fn at(self, phase: Phase) -> PhaseResult<T>;
}

impl<T> AtPhase<T> for Result<T> {
    fn at(self, phase: Phase) -> PhaseResult<T> {
        self.map_err(|e| (phase, e))
    }
}

/// Converts container images into bootable disk images.
pub struct Converter {
    config: ConvertConfig,
    backend: Arc<dyn DiskBackend>,
    transport: Option<Arc<dyn RegistryTransport>>,
}

impl Converter {
    /// Create a converter that operates on the real host.
    pub fn new(config: ConvertConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend: Arc::new(HostBackend::new()),
            transport: None,
        })
    }

    /// Replace the disk backend.
    pub fn with_backend(mut self, backend: Arc<dyn DiskBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the registry transport.
    pub fn with_transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    fn registry(&self, auth: RegistryAuth) -> Result<RegistryClient> {
        match &self.transport {
            Some(transport) => Ok(RegistryClient::with_transport(
                transport.clone(),
                &self.config.registry,
                auth,
            )),
            None => RegistryClient::new(&self.config.registry, auth),
        }
    }

    /// Run one conversion.
    ///
    /// All resources acquired by the conversion are released before this
    /// returns. Failures carry the phase they happened in; errors hit while
    /// unwinding are attached to the failure rather than replacing it.
    pub async fn convert(
        &self,
        request: ConversionRequest,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> std::result::Result<ConversionOutput, ConversionFailure> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let tracker = Arc::new(ResourceTracker::new());
        let token = cancel.child_token();
        let limit = self.config.conversion_timeout();

        tracing::info!(
            reference = %request.reference,
            platform = %request.platform,
            size_bytes = request.size_bytes,
            output = %request.output.display(),
            "Starting conversion"
        );

        let pipeline = self.run(&request, &reporter, tracker.clone(), token.clone(), started_at);
        tokio::pin!(pipeline);

        let result = tokio::select! {
            result = &mut pipeline => result,
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(timeout_secs = limit.as_secs(), "Conversion timed out, cancelling");
                token.cancel();
                match (&mut pipeline).await {
                    Err((phase, ConvertError::Cancelled(_))) => {
                        Err((phase, ConvertError::Timeout(format!("conversion exceeded {}s", limit.as_secs()))))
                    }
                    other => other,
                }
            }
        };

        let release_errors = tracker.release_all();
        match result {
            Ok(output) => {
                for err in &release_errors {
                    tracing::warn!(error = %err, "Error releasing conversion resource");
                }
                tracing::info!(
                    image = %output.image_path.display(),
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "Conversion finished"
                );
                Ok(output)
            }
            Err((phase, error)) => {
                tracing::error!(
                    phase = %phase,
                    kind = ?error.kind(),
                    error = %error,
                    release_errors = release_errors.len(),
                    "Conversion failed"
                );
                let mut failure = ConversionFailure::new(phase, error);
                failure.release_errors = release_errors;
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        reporter: &ProgressReporter,
        tracker: Arc<ResourceTracker>,
        token: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> PhaseResult<ConversionOutput> {
        // Resolve
        checkpoint(&token, Phase::Resolve)?;
        reporter.phase_started(Phase::Resolve, format!("Resolving {}", request.reference));
        let reference = ImageReference::parse(&request.reference).at(Phase::Resolve)?;
        // Fail on size and host capability before touching the network.
        let preflight = DiskLayout::plan(&self.config, request.size_bytes).at(Phase::Resolve)?;
        self.backend.check(&preflight).at(Phase::Resolve)?;

        let client = self.registry(request.auth.clone()).at(Phase::Resolve)?;
        let manifest = cancellable(&token, Phase::Resolve, client.resolve(&reference, &request.platform)).await?;
        reporter.phase_finished(
            Phase::Resolve,
            format!("{} ({} layers)", manifest.digest, manifest.layers.len()),
        );

        // Download
        checkpoint(&token, Phase::Download)?;
        let workspace = Workspace::create(
            self.config.workspace_dir.as_deref(),
            self.config.preserve_workspace,
            &tracker,
        )
        .at(Phase::Download)?;
        let blobs = self
            .download(&client, &reference, &manifest, &workspace, reporter, &token)
            .await?;

        // Assemble
        checkpoint(&token, Phase::Assemble)?;
        reporter.phase_started(Phase::Assemble, format!("Applying {} layers", blobs.len()));
        let rootfs = workspace.rootfs_dir();
        let assemble_token = token.clone();
        let root = tokio::task::spawn_blocking(move || layers::assemble(&rootfs, &blobs, Some(assemble_token)))
            .await
            .map_err(|e| ConvertError::Internal(format!("layer assembly task failed: {}", e)))
            .and_then(|r| r)
            .at(Phase::Assemble)?;
        reporter.phase_finished(
            Phase::Assemble,
            format!("{} entries, {} bytes", root.len(), root.content_bytes()),
        );

        // Plan through Finalize
        checkpoint(&token, Phase::Plan)?;
        let image = self
            .build_disk(request, &workspace, root, reporter.clone(), tracker, token)
            .await?;

        Ok(ConversionOutput {
            image_path: image.path,
            size_bytes: image.size_bytes,
            reference: reference.full_reference(),
            manifest_digest: manifest.digest.to_string(),
            layers: manifest.layers.len(),
            kernel: image.boot.as_ref().map(|b| b.kernel.clone()),
            generic_boot: image.boot.as_ref().map(|b| b.generic).unwrap_or(false),
            workspace: self
                .config
                .preserve_workspace
                .then(|| workspace.path().to_path_buf()),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Fetch all layers into the workspace, a bounded number at a time.
    ///
    /// Returns `(label, blob path)` pairs in manifest order regardless of
    /// completion order.
    async fn download(
        &self,
        client: &RegistryClient,
        reference: &ImageReference,
        manifest: &Manifest,
        workspace: &Workspace,
        reporter: &ProgressReporter,
        token: &CancellationToken,
    ) -> PhaseResult<Vec<(String, PathBuf)>> {
        let total = manifest.layers.len();
        let concurrency = self.config.registry.download_concurrency();
        let total_bytes: u64 = manifest.layers.iter().map(|l| l.size).sum();
        reporter.phase_started(
            Phase::Download,
            format!("Fetching {} layers ({} bytes)", total, total_bytes),
        );
        tracing::debug!(layers = total, concurrency, "Downloading layers");

        let mut done = 0usize;
        let blobs: Vec<(String, PathBuf)> = stream::iter(manifest.layers.iter())
            .map(|layer| {
                let path = workspace.blob_path(layer.digest.hex());
                cancellable(token, Phase::Download, fetch_to_file(client, reference, layer, path))
            })
            .buffered(concurrency)
            .map_ok(|blob| {
                done += 1;
                reporter.phase_progress(
                    Phase::Download,
                    done as f32 / total.max(1) as f32,
                    format!("Fetched {}", blob.0),
                );
                blob
            })
            .try_collect()
            .await?;

        reporter.phase_finished(Phase::Download, format!("Fetched {} layers", total));
        Ok(blobs)
    }

    /// Run the disk phases on the blocking pool.
    async fn build_disk(
        &self,
        request: &ConversionRequest,
        workspace: &Workspace,
        root: AssembledRoot,
        reporter: ProgressReporter,
        tracker: Arc<ResourceTracker>,
        token: CancellationToken,
    ) -> PhaseResult<DiskImage> {
        let config = self.config.clone();
        let backend = self.backend.clone();
        let size = request.size_bytes;
        let output = request.output.clone();
        let mount_dir = workspace.mount_dir();

        tokio::task::spawn_blocking(move || {
            build_disk_blocking(&config, backend, tracker, &root, size, &output, &mount_dir, &reporter, token)
        })
        .await
        .map_err(|e| (Phase::Plan, ConvertError::Internal(format!("disk build task failed: {}", e))))?
    }
}

#[allow(clippy::too_many_arguments)]
fn build_disk_blocking(
    config: &ConvertConfig,
    backend: Arc<dyn DiskBackend>,
    tracker: Arc<ResourceTracker>,
    root: &AssembledRoot,
    size: u64,
    output: &Path,
    mount_dir: &Path,
    reporter: &ProgressReporter,
    token: CancellationToken,
) -> PhaseResult<DiskImage> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConvertError::io(format!("creating {}", parent.display()), e))
            .at(Phase::Plan)?;
    }

    reporter.phase_started(Phase::Plan, "Planning disk layout");
    let mut builder = DiskImageBuilder::plan(config, backend, tracker, root, size, output, mount_dir)
        .at(Phase::Plan)?
        .with_cancellation(token);
    reporter.phase_finished(
        Phase::Plan,
        format!("{} partition(s), {} bytes", builder.layout().partitions.len(), builder.layout().total_bytes),
    );

    reporter.phase_started(Phase::Partition, "Writing partition table");
    builder.partition().at(Phase::Partition)?;
    reporter.phase_finished(Phase::Partition, "Partition table written");

    reporter.phase_started(Phase::Format, "Creating filesystems");
    builder.format().at(Phase::Format)?;
    reporter.phase_finished(Phase::Format, "Filesystems created");

    reporter.phase_started(Phase::Populate, format!("Copying {} entries", root.len()));
    let stats = builder.populate(root).at(Phase::Populate)?;
    reporter.phase_finished(
        Phase::Populate,
        format!("{} files, {} bytes", stats.files, stats.bytes),
    );

    reporter.phase_started(Phase::Bootloader, "Installing bootloader");
    let boot = builder.install_bootloader().at(Phase::Bootloader)?;
    reporter.phase_finished(Phase::Bootloader, format!("Kernel {}", boot.kernel.display()));

    reporter.phase_started(Phase::Finalize, "Finalizing image");
    let image = builder.finalize().at(Phase::Finalize)?;
    reporter.phase_finished(Phase::Finalize, format!("{}", image.path.display()));
    Ok(image)
}

async fn fetch_to_file(
    client: &RegistryClient,
    reference: &ImageReference,
    layer: &LayerDescriptor,
    path: PathBuf,
) -> Result<(String, PathBuf)> {
    let open_path = path.clone();
    let mut file = client
        .fetch_layer_to(reference, layer, move || tokio::fs::File::create(open_path.clone()))
        .await?;
    file.flush()
        .await
        .map_err(|e| ConvertError::io(format!("writing {}", path.display()), e))?;
    Ok((layer.digest.short().to_string(), path))
}

fn checkpoint(token: &CancellationToken, phase: Phase) -> PhaseResult<()> {
    if token.is_cancelled() {
        return Err((phase, ConvertError::Cancelled(phase)));
    }
    Ok(())
}

async fn cancellable<T>(
    token: &CancellationToken,
    phase: Phase,
    fut: impl Future<Output = Result<T>>,
) -> PhaseResult<T> {
    tokio::select! {
        result = fut => result.at(phase),
        _ = token.cancelled() => Err((phase, ConvertError::Cancelled(phase))),
    }
}
