//! `dockboot convert` command: Build a bootable disk image from an image reference.

use std::path::PathBuf;

use clap::Args;
use dockboot_core::ProgressReporter;
use dockboot_runtime::{ConversionRequest, Converter, ImageReference, Platform, RegistryAuth};
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct ConvertArgs {
    /// Image reference (e.g., "alpine:3.19", "ghcr.io/org/app@sha256:...")
    pub image: String,

    /// Target platform as os/arch[/variant]
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,

    /// Disk size (e.g., "512M", "2G", "4GiB")
    #[arg(long, default_value = "2G", value_parser = output::parse_size_bytes)]
    pub size: u64,

    /// Output image path (default: <image name>.img in the current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Registry username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Read the registry password from stdin
    #[arg(long)]
    pub password_stdin: bool,

    /// Keep the scratch workspace after the conversion
    #[arg(long)]
    pub keep_workspace: bool,

    /// Configuration file (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ConvertArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(args.config.as_deref())?;
    if args.keep_workspace {
        config.preserve_workspace = true;
    }

    let reference = ImageReference::parse(&args.image)?;
    let platform = Platform::parse(&args.platform)?;
    let auth = resolve_auth(&args, &reference.registry)?;
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&reference));

    let converter = Converter::new(config)?;
    let request = ConversionRequest::new(args.image.clone(), args.size, output_path)
        .with_platform(platform)
        .with_auth(auth);

    let reporter = if args.quiet {
        ProgressReporter::silent()
    } else {
        ProgressReporter::new(|update| eprintln!("{}", output::render_progress(update)))
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling conversion...");
            on_signal.cancel();
        }
    });

    let result = converter.convert(request, reporter, cancel).await;
    signal.abort();
    let converted = result?;

    println!("Image:    {}", converted.image_path.display());
    println!("Size:     {}", output::format_bytes(converted.size_bytes));
    println!("Digest:   {}", converted.manifest_digest);
    if let Some(kernel) = &converted.kernel {
        let kind = if converted.generic_boot { "generic" } else { "distro" };
        println!("Kernel:   {} ({})", kernel.display(), kind);
    }
    if let Some(workspace) = &converted.workspace {
        println!("Workspace: {}", workspace.display());
    }
    println!(
        "Took {:.1}s",
        converted.duration().num_milliseconds() as f64 / 1000.0
    );
    Ok(())
}

fn resolve_auth(
    args: &ConvertArgs,
    registry: &str,
) -> Result<RegistryAuth, Box<dyn std::error::Error>> {
    match (&args.username, args.password_stdin) {
        (Some(username), true) => {
            let password = super::read_stdin_line()?;
            if password.is_empty() {
                return Err("Empty password on stdin".into());
            }
            Ok(RegistryAuth::basic(username.clone(), password))
        }
        (Some(_), false) => Err("--username requires --password-stdin".into()),
        (None, true) => Err("--password-stdin requires --username".into()),
        (None, false) => Ok(RegistryAuth::from_credential_store(registry)),
    }
}

/// `<last repository segment>.img`.
fn default_output(reference: &ImageReference) -> PathBuf {
    let name = reference
        .repository
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("disk");
    PathBuf::from(format!("{name}.img"))
}
