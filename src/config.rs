use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

const DEFAULT_MAX_BUCKET_BYTES: u64 = 25 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    /// Port for the HTTP health probes.
    pub port: u16,
    /// Port for client sessions.
    pub session_port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub site: SiteConfig,
}

/// Deployment settings the upload adapter needs at request time.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Name of the hosted space; also the entitlement a user must hold.
    pub space: String,
    pub domain: String,
    pub protocol: String,
    /// Quota ceiling per bucket.
    pub max_bucket_bytes: u64,
}

impl SiteConfig {
    /// Public URL of an uploaded asset.
    pub fn asset_url(&self, user_name: &str, project_name: &str, path: &str) -> String {
        format!(
            "{}://{}-{}.{}/{}",
            self.protocol,
            user_name,
            project_name,
            self.domain,
            path.trim_start_matches('/')
        )
    }
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    RegisterUser { name: String, public_key: String },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Session-driven static asset uploads")]
pub struct Args {
    /// Host to bind to (overrides ASSET_DROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP probe port (overrides ASSET_DROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Session port (overrides ASSET_DROP_SESSION_PORT)
    #[arg(long)]
    pub session_port: Option<u16>,

    /// Directory where objects are stored (overrides ASSET_DROP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides ASSET_DROP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Domain assets are served under (overrides ASSET_DROP_DOMAIN)
    #[arg(long)]
    pub domain: Option<String>,

    /// URL scheme for asset links (overrides ASSET_DROP_PROTOCOL)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Space name and required entitlement (overrides ASSET_DROP_SPACE)
    #[arg(long)]
    pub space: Option<String>,

    /// Per-user quota in bytes (overrides ASSET_DROP_MAX_BUCKET_BYTES)
    #[arg(long)]
    pub max_bucket_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Register a user with the given name, grant the space entitlement, and exit
    #[arg(long, requires = "public_key")]
    pub register_user: Option<String>,

    /// Public key text for --register-user, e.g. "ssh-ed25519 AAAA..."
    #[arg(long)]
    pub public_key: Option<String>,
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_port = env_parse("ASSET_DROP_PORT", 3000u16)?;
        let env_session_port = env_parse("ASSET_DROP_SESSION_PORT", 2222u16)?;
        let env_max_bytes = env_parse("ASSET_DROP_MAX_BUCKET_BYTES", DEFAULT_MAX_BUCKET_BYTES)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or_else(|| env_or("ASSET_DROP_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            session_port: args.session_port.unwrap_or(env_session_port),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("ASSET_DROP_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or(
                    "ASSET_DROP_DATABASE_URL",
                    "sqlite://./data/meta/asset_drop.db",
                )
            }),
            site: SiteConfig {
                space: args
                    .space
                    .unwrap_or_else(|| env_or("ASSET_DROP_SPACE", "pgs")),
                domain: args
                    .domain
                    .unwrap_or_else(|| env_or("ASSET_DROP_DOMAIN", "pgs.localhost")),
                protocol: args
                    .protocol
                    .unwrap_or_else(|| env_or("ASSET_DROP_PROTOCOL", "https")),
                max_bucket_bytes: args.max_bucket_bytes.unwrap_or(env_max_bytes),
            },
        };

        let mode = match (args.migrate, args.register_user, args.public_key) {
            (true, _, _) => Mode::Migrate,
            (false, Some(name), Some(public_key)) => Mode::RegisterUser { name, public_key },
            _ => Mode::Serve,
        };

        Ok((cfg, mode))
    }
}
