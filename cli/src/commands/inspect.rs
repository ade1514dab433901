//! `dockboot inspect` command: Resolve an image and show its manifest summary.

use std::path::PathBuf;

use clap::Args;
use dockboot_runtime::{ImageReference, Platform, RegistryAuth, RegistryClient};

use crate::output;

#[derive(Args)]
pub struct InspectArgs {
    /// Image reference
    pub image: String,

    /// Target platform as os/arch[/variant]
    #[arg(long, default_value = "linux/amd64")]
    pub platform: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Configuration file (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(args.config.as_deref())?;
    let reference = ImageReference::parse(&args.image)?;
    let platform = Platform::parse(&args.platform)?;

    let auth = RegistryAuth::from_credential_store(&reference.registry);
    let client = RegistryClient::new(&config.registry, auth)?;
    let info = client.inspect(&reference, &platform).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let mut table = output::new_table(&["FIELD", "VALUE"]);
    table.add_row(vec!["Reference".to_string(), info.reference.clone()]);
    table.add_row(vec!["Registry".to_string(), info.registry.clone()]);
    table.add_row(vec!["Repository".to_string(), info.repository.clone()]);
    table.add_row(vec![
        "Tag".to_string(),
        info.tag.clone().unwrap_or_else(|| "<none>".to_string()),
    ]);
    table.add_row(vec!["Digest".to_string(), info.digest.clone()]);
    table.add_row(vec!["Schema".to_string(), format!("{:?}", info.schema)]);
    table.add_row(vec!["Platform".to_string(), info.platform.clone()]);
    table.add_row(vec!["Layers".to_string(), info.layer_count.to_string()]);
    table.add_row(vec![
        "Compressed size".to_string(),
        output::format_bytes(info.compressed_size),
    ]);
    println!("{table}");
    Ok(())
}
