use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;
use portcullis::authz::loader;
use portcullis::jwks::KeyManager;
use portcullis::settings::Settings;
use portcullis::web::AppState;
use portcullis::{jobs, storage, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version,
    about = "Authorization, session and admission control service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an argon2 hash suitable for a `password-hash` seed property
    HashPassword { password: String },
    /// Parse and validate policy seed files without starting the server
    CheckPolicies {
        /// Defaults to `authz.policies_dir`
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    if let Some(Command::HashPassword { password }) = &cli.command {
        println!("{}", storage::hash_password(password)?);
        return Ok(());
    }

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    if let Some(Command::CheckPolicies { dir }) = cli.command {
        let dir = dir
            .or_else(|| settings.authz.policies_dir.clone())
            .ok_or_else(|| miette::miette!("no policy directory given and authz.policies_dir is unset"))?;
        let bundle = loader::load_policies(&dir)?;
        println!(
            "{}: {} roles, {} permissions, {} principals",
            dir.display(),
            bundle.roles.len(),
            bundle.permissions.len(),
            bundle.principals.len()
        );
        return Ok(());
    }

    // init storage (database or in-memory)
    let store = storage::connect(&settings.database).await?;

    // seed roles, grants and principals from policy files
    if let Some(dir) = &settings.authz.policies_dir {
        let bundle = loader::load_policies(dir)?;
        loader::sync_bundle(store.as_ref(), &bundle).await?;
    }

    // init signing keys (generate if missing)
    let keys = Arc::new(KeyManager::new(settings.keys.clone())?);

    let state = AppState::build(settings, store, keys).await?;

    let _scheduler = jobs::init_scheduler(
        state.sessions.clone(),
        state.registry.clone(),
        &state.settings,
    )
    .await?;

    // start web server
    web::serve(state).await
}
