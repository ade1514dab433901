//! `dockboot login` command: Store registry credentials.

use clap::Args;
use dockboot_runtime::oci::StoredCredential;
use dockboot_runtime::CredentialStore;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn execute(args: LoginArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "docker.io".to_string());

    let username = match args.username {
        Some(u) => u,
        None => {
            eprint!("Username: ");
            super::read_stdin_line()?.trim().to_string()
        }
    };

    let password = if args.password_stdin {
        super::read_stdin_line()?
    } else {
        eprint!("Password: ");
        super::read_stdin_line()?
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = CredentialStore::default_path()?;
    store.store(&server, StoredCredential { username, password })?;

    println!("Login Succeeded");
    Ok(())
}
