//! CLI command definitions and dispatch.

mod convert;
mod inspect;
mod login;
mod logout;

use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};
use dockboot_core::ConvertConfig;

/// Dockboot: convert container images into bootable disk images.
#[derive(Parser)]
#[command(name = "dockboot", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Log line format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Convert an image into a bootable raw disk image
    Convert(convert::ConvertArgs),
    /// Show the manifest an image resolves to
    Inspect(inspect::InspectArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
}

/// Load `--config` if given, defaults otherwise.
pub(crate) fn load_config(path: Option<&Path>) -> Result<ConvertConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => ConvertConfig::from_file(path)?,
        None => ConvertConfig::default(),
    };
    config.validate()?;
    tracing::debug!(path = ?path, "Configuration loaded");
    Ok(config)
}

/// Read one line from stdin with the trailing newline removed.
pub(crate) fn read_stdin_line() -> Result<String, Box<dyn std::error::Error>> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Convert(args) => convert::execute(args).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_convert_defaults() {
        let cli = Cli::try_parse_from(["dockboot", "convert", "alpine:3.19"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Convert(args) => {
                assert_eq!(args.image, "alpine:3.19");
                assert_eq!(args.platform, "linux/amd64");
                assert_eq!(args.size, 2 * 1024 * 1024 * 1024);
                assert!(args.output.is_none());
                assert!(!args.keep_workspace);
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn test_convert_options() {
        let cli = Cli::try_parse_from([
            "dockboot",
            "convert",
            "ghcr.io/org/app:v1",
            "--size",
            "512MiB",
            "--platform",
            "linux/arm64/v8",
            "-o",
            "app.img",
            "--username",
            "bob",
            "--password-stdin",
            "--keep-workspace",
            "--verbose",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Convert(args) => {
                assert_eq!(args.size, 512 * 1024 * 1024);
                assert_eq!(args.platform, "linux/arm64/v8");
                assert_eq!(args.output.as_deref(), Some(Path::new("app.img")));
                assert_eq!(args.username.as_deref(), Some("bob"));
                assert!(args.password_stdin);
                assert!(args.keep_workspace);
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn test_bad_size_rejected() {
        assert!(Cli::try_parse_from(["dockboot", "convert", "alpine", "--size", "lots"]).is_err());
    }

    #[test]
    fn test_login_and_logout_parse() {
        let cli = Cli::try_parse_from(["dockboot", "login", "ghcr.io", "-u", "bob", "--password-stdin"])
            .unwrap();
        assert!(matches!(cli.command, Command::Login(_)));
        let cli = Cli::try_parse_from(["dockboot", "logout"]).unwrap();
        assert!(matches!(cli.command, Command::Logout(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dockboot.yaml");
        std::fs::write(&path, "conversion_timeout_secs: 60\npreserve_workspace: true\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.conversion_timeout_secs, 60);
        assert!(config.preserve_workspace);
        assert!(load_config(None).is_ok());
    }
}
