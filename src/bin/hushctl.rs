use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use hushline::{
    ops::{self, AuthPatch},
    platform::Platform,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hushctl", version, about = "Operator tasks for a hushline database")]
struct Args {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://hushline.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates five confirmed sample users
    SeedUsers {
        #[arg(long, default_value = "password123")]
        password: String,
    },
    /// Updates auth settings and prints what was stored
    ConfigureAuth {
        #[arg(long, env = "PUBLIC_URL")]
        site_url: Option<String>,

        #[arg(long)]
        session_ttl_secs: Option<i64>,

        #[arg(long)]
        mailer_autoconfirm: Option<bool>,

        #[arg(long)]
        min_password_length: Option<usize>,
    },
    /// Stores the confirmation and recovery mail templates found in a directory
    ConfigureEmail {
        #[arg(long, default_value = "templates")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let platform = Platform::open(&args.database_url, std::time::Duration::from_secs(45)).await?;

    match args.command {
        Command::SeedUsers { password } => {
            let report = ops::seed_users(&platform.identities, &password).await;
            println!("created: {}", report.created.len());
            for email in &report.created {
                println!("  + {email}");
            }
            println!("already there: {}", report.existed.len());
            for email in &report.existed {
                println!("  = {email}");
            }
            println!("failed: {}", report.failed.len());
            for (email, reason) in &report.failed {
                println!("  ! {email}: {reason}");
            }
            println!("sample users sign in with password {password:?}");

            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::ConfigureAuth {
            site_url,
            session_ttl_secs,
            mailer_autoconfirm,
            min_password_length,
        } => {
            let settings = ops::configure_auth(
                &platform.identities,
                AuthPatch {
                    site_url,
                    session_ttl_secs,
                    mailer_autoconfirm,
                    min_password_length,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::ConfigureEmail { dir } => {
            let configured = ops::configure_email(&platform.identities, &dir).await?;
            if configured.is_empty() {
                println!("no templates found in {}", dir.display());
                return Ok(ExitCode::FAILURE);
            }
            for kind in configured {
                println!("stored {} ({})", kind.as_str(), kind.default_subject());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
