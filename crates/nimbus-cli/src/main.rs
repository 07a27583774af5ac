//! nimbus: encrypted file transfer client
//!
//! Commands:
//!   upload <file> --parent <id> [--encrypt]   - chunked (optionally encrypted) upload
//!   download <node-id> <dest>                 - ranged download, decrypting when needed
//!   keys generate                             - create a passphrase-protected key pair
//!   keys resolve [--room|--file] [--limit]    - wrap file keys for users missing them
//!   config show                               - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nimbus_core::config::NimbusConfig;
use nimbus_core::keys::{UserKeyPair, UserKeyPairVersion};
use nimbus_core::types::{FileUploadRequest, MissingKeysFilter, Node, NodeId, ResolutionStrategy};
use nimbus_crypto::{generate_user_key_pair_with_params, verify_key_pair, KdfParams};
use nimbus_transfer::{
    spawn_download, spawn_upload, Client, ClientBuilder, Credentials, TransferHandle,
    TransferListener,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "nimbus",
    version,
    about = "Encrypted chunked file transfer client"
)]
struct Cli {
    /// Path to nimbus.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "NIMBUS_CONFIG",
        default_value = "~/.config/nimbus/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "NIMBUS_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "NIMBUS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a local file
    ///
    /// The access token is read from NIMBUS_ACCESS_TOKEN; NIMBUS_REFRESH_TOKEN
    /// enables transparent refresh.
    Upload {
        /// Local file to upload
        file: PathBuf,
        /// Parent node id
        #[arg(long, short = 'p')]
        parent: NodeId,
        /// Remote file name (default: local file name)
        #[arg(long)]
        name: Option<String>,
        /// Encrypt with the configured key pair
        #[arg(long)]
        encrypt: bool,
        /// Replace an existing file of the same name instead of renaming
        #[arg(long)]
        overwrite: bool,
    },

    /// Download a file node
    Download {
        /// Node id of the file
        node_id: NodeId,
        /// Local destination path
        dest: PathBuf,
    },

    /// Key pair and file key management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Generate a key pair and store it at crypto.key_pair_file
    Generate {
        /// Key pair generation (default: crypto.key_pair_version)
        #[arg(long)]
        version: Option<String>,
        /// Replace an existing key pair file
        #[arg(long)]
        force: bool,
    },

    /// Wrap file keys for users who can see a file but hold no key
    Resolve {
        /// Restrict to one room
        #[arg(long, conflicts_with = "file")]
        room: Option<NodeId>,
        /// Restrict to one file
        #[arg(long)]
        file: Option<NodeId>,
        /// Maximum number of missing keys to examine
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.log.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(&level, &format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Upload {
            file,
            parent,
            name,
            encrypt,
            overwrite,
        } => cmd_upload(&config, &file, parent, name, encrypt, overwrite).await,
        Commands::Download { node_id, dest } => cmd_download(&config, node_id, &dest).await,
        Commands::Keys {
            action: KeysAction::Generate { version, force },
        } => cmd_keys_generate(&config, version, force),
        Commands::Keys {
            action: KeysAction::Resolve { room, file, limit },
        } => cmd_keys_resolve(&config, room, file, limit).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
    }
}

// ── Config, logging, credentials ──────────────────────────────────────────────

/// Parsed config plus whether the file existed.
async fn load_config(path: &Path) -> Result<(NimbusConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((NimbusConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout belongs to command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

fn credentials_from_env() -> Result<Credentials> {
    let access = std::env::var("NIMBUS_ACCESS_TOKEN").context(
        "NIMBUS_ACCESS_TOKEN not set\n\
         Export an access token for the service, e.g.:\n\
         \texport NIMBUS_ACCESS_TOKEN=...\n\
         \texport NIMBUS_REFRESH_TOKEN=...   (optional, enables refresh)",
    )?;
    let refresh = std::env::var("NIMBUS_REFRESH_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    Ok(Credentials::new(access, refresh))
}

fn build_client(config: &NimbusConfig) -> Result<Client> {
    let client = ClientBuilder::from_config(config)
        .context("configuring service endpoint")?
        .credentials(credentials_from_env()?)
        .build()?;
    Ok(client)
}

/// NIMBUS_KEY_PASSPHRASE, or an interactive prompt.
fn read_passphrase(prompt: &str) -> Result<SecretString> {
    if let Ok(p) = std::env::var("NIMBUS_KEY_PASSPHRASE") {
        return Ok(SecretString::from(p));
    }
    let p = rpassword::prompt_password(prompt).context("reading passphrase")?;
    Ok(SecretString::from(p))
}

fn load_key_pair(config: &NimbusConfig) -> Result<UserKeyPair> {
    let path = expand_tilde(&config.crypto.key_pair_file);
    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "reading key pair: {}\n  Create one with: nimbus keys generate",
            path.display()
        )
    })?;
    serde_json::from_str(&content).with_context(|| format!("parsing key pair: {}", path.display()))
}

// ── Progress reporting ────────────────────────────────────────────────────────

fn make_progress_bar(total: Option<u64>, prefix: &str) -> ProgressBar {
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {bytes} {msg}") {
                pb.set_style(style);
            }
            pb
        }
    };
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Drives a progress bar from transfer events.
struct BarListener {
    bar: ProgressBar,
}

impl TransferListener for BarListener {
    fn on_running(&self, _id: &str, bytes_done: u64, bytes_total: Option<u64>) {
        if let Some(total) = bytes_total {
            self.bar.set_length(total);
        }
        self.bar.set_position(bytes_done);
    }

    fn on_finished(&self, _id: &str, _node: Option<&Node>) {
        self.bar.finish_with_message("done");
    }

    fn on_canceled(&self, _id: &str) {
        self.bar.abandon_with_message("canceled");
    }

    fn on_failed(&self, _id: &str, _error: &nimbus_core::NimbusError) {
        self.bar.abandon_with_message("failed");
    }
}

/// Join a spawned transfer, cancelling it on Ctrl-C.
async fn join_with_interrupt<T>(handle: TransferHandle<T>) -> nimbus_core::NimbusResult<T> {
    let _guard = CancelOnCtrlC::watch(handle.cancel_token().clone());
    handle.join().await
}

/// Cancels a token on Ctrl-C until dropped.
struct CancelOnCtrlC(JoinHandle<()>);

impl CancelOnCtrlC {
    fn watch(token: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, cancelling...");
                token.cancel();
            }
        }))
    }
}

impl Drop for CancelOnCtrlC {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ── `nimbus upload` ───────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &NimbusConfig,
    file: &Path,
    parent: NodeId,
    name: Option<String>,
    encrypt: bool,
    overwrite: bool,
) -> Result<()> {
    let client = build_client(config)?;
    let meta = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    anyhow::ensure!(meta.is_file(), "{} is not a regular file", file.display());

    let name = match name {
        Some(n) => n,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("cannot derive a remote name; pass --name")?,
    };
    let recipient = if encrypt {
        Some(load_key_pair(config)?.public_key_container)
    } else {
        None
    };

    let strategy = if overwrite {
        ResolutionStrategy::Overwrite
    } else {
        ResolutionStrategy::Autorename
    };
    let request = FileUploadRequest::new(parent, name.clone())
        .with_size(meta.len())
        .with_resolution_strategy(strategy);

    println!(
        "Uploading {} → parent {} as {:?}{}",
        file.display(),
        parent,
        name,
        if encrypt { " (encrypted)" } else { "" }
    );

    let reader = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let bar = make_progress_bar(Some(meta.len()), "upload");
    let listener = Arc::new(BarListener { bar });
    let engine = client.upload(request, recipient);
    let handle = spawn_upload(engine, reader, config.transfer.block_size, listener);

    match join_with_interrupt(handle).await? {
        Some(node) => {
            println!();
            println!("Uploaded:");
            println!("  node:  {}", node.id);
            println!("  name:  {}", node.name);
            println!("  bytes: {}", fmt_bytes(meta.len()));
        }
        None => {
            println!();
            println!("Upload submitted; the service has not confirmed completion yet.");
        }
    }
    Ok(())
}

// ── `nimbus download` ─────────────────────────────────────────────────────────

async fn cmd_download(config: &NimbusConfig, node_id: NodeId, dest: &Path) -> Result<()> {
    let client = build_client(config)?;

    let session = client.session();
    let api = session.api();
    let node = session
        .call(&CancellationToken::new(), |token| async move {
            api.get_node(&token, node_id).await
        })
        .await
        .with_context(|| format!("looking up node {node_id}"))?;

    let engine = if node.is_encrypted.unwrap_or(false) {
        let key_pair = load_key_pair(config)?;
        let passphrase = read_passphrase("Key pair passphrase: ")?;
        client
            .encrypted_download(node_id, &key_pair, &passphrase)
            .await
            .context("resolving file key")?
    } else {
        client.download(node_id, None)
    };

    println!(
        "Downloading {} ({}) → {}",
        node.name,
        node.size.map(fmt_bytes).unwrap_or_else(|| "unknown size".into()),
        dest.display()
    );

    let writer = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    let bar = make_progress_bar(node.size, "download");
    let listener = Arc::new(BarListener { bar });
    let handle = spawn_download(engine, writer, config.transfer.block_size, listener);

    match join_with_interrupt(handle).await {
        Ok(bytes) => {
            println!();
            println!("Downloaded:");
            println!("  local: {}", dest.display());
            println!("  bytes: {}", fmt_bytes(bytes));
            Ok(())
        }
        Err(e) => {
            // never leave a truncated file behind
            if let Err(rm) = tokio::fs::remove_file(dest).await {
                warn!(path = %dest.display(), error = %rm, "could not remove partial download");
            }
            Err(e.into())
        }
    }
}

// ── `nimbus keys` ─────────────────────────────────────────────────────────────

fn kdf_params(config: &NimbusConfig, version: &UserKeyPairVersion) -> KdfParams {
    let base = KdfParams::for_version(version);
    let c = &config.crypto;
    KdfParams {
        mem_cost_kib: if c.argon2_mem_cost_kib > 0 { c.argon2_mem_cost_kib } else { base.mem_cost_kib },
        time_cost: if c.argon2_time_cost > 0 { c.argon2_time_cost } else { base.time_cost },
        parallelism: if c.argon2_parallelism > 0 { c.argon2_parallelism } else { base.parallelism },
    }
}

fn cmd_keys_generate(config: &NimbusConfig, version: Option<String>, force: bool) -> Result<()> {
    let version =
        UserKeyPairVersion::from(version.unwrap_or_else(|| config.crypto.key_pair_version.clone()));
    anyhow::ensure!(
        !matches!(version, UserKeyPairVersion::Unsupported(_)),
        "unsupported key pair version {version} (expected X25519-1 or X25519-2)"
    );

    let path = expand_tilde(&config.crypto.key_pair_file);
    if path.exists() && !force {
        anyhow::bail!(
            "key pair already exists at {}\n  Pass --force to replace it (files encrypted for the old key become unreadable)",
            path.display()
        );
    }

    let passphrase = read_passphrase("New key pair passphrase: ")?;
    if std::env::var("NIMBUS_KEY_PASSPHRASE").is_err() {
        let confirm = rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?;
        anyhow::ensure!(
            confirm == passphrase.expose_secret(),
            "passphrases do not match"
        );
    }

    let params = kdf_params(config, &version);
    info!(%version, mem_cost_kib = params.mem_cost_kib, "generating key pair");
    let key_pair = generate_user_key_pair_with_params(version.clone(), &passphrase, &params)?;
    anyhow::ensure!(
        verify_key_pair(&key_pair, &passphrase)?,
        "generated key pair failed verification"
    );

    write_key_pair(&path, &key_pair)?;
    println!("Key pair ({version}) written to {}", path.display());
    println!("  public key: {}", key_pair.public_key_container.public_key);
    Ok(())
}

fn write_key_pair(path: &Path, key_pair: &UserKeyPair) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating directory: {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(key_pair)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("writing key pair: {}", path.display()))?;
    std::io::Write::write_all(&mut file, json.as_bytes())?;
    Ok(())
}

async fn cmd_keys_resolve(
    config: &NimbusConfig,
    room: Option<NodeId>,
    file: Option<NodeId>,
    limit: u64,
) -> Result<()> {
    let client = build_client(config)?;
    let key_pair = load_key_pair(config)?;
    let passphrase = read_passphrase("Key pair passphrase: ")?;

    let filter = MissingKeysFilter {
        room_id: room,
        file_id: file,
    };
    let cancel = CancellationToken::new();
    let _guard = CancelOnCtrlC::watch(cancel.clone());

    let spinner = make_progress_bar(None, "keys");
    spinner.set_message("resolving missing file keys");
    let done = client
        .file_keys()
        .resolve_missing_keys(&cancel, filter, limit, &key_pair, &passphrase)
        .await;
    spinner.finish_and_clear();

    if done? {
        println!("All missing file keys resolved.");
    } else {
        println!("Examined {limit} missing keys; more remain. Run again to continue.");
    }
    Ok(())
}

// ── `nimbus config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &NimbusConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
