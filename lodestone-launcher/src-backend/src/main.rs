//! Backend process of the Lodestone launcher. Speaks newline-delimited JSON
//! on stdin/stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::Result;
use directories::BaseDirs;
use lodestone_lib::config::LauncherConfig;
use lodestone_lib::Launcher;

const DATA_DIR_ENV: &str = "LODESTONE_DATA_DIR";

/// `$LODESTONE_DATA_DIR`, or `.lodestone` under the user's config directory.
fn data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base_dirs = BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("Failed to determine user's config directory"))?;
    Ok(base_dirs.config_dir().join(".lodestone"))
}

fn init_logging(config: &LauncherConfig) {
    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Stderr)
        .filter_level(config.level_filter())
        .format_timestamp_millis();
    // RUST_LOG wins over the config file
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let root = data_dir()?;
    std::fs::create_dir_all(&root)?;
    let config_path = root.join("config.json");
    let first_start = !config_path.exists();
    let config = LauncherConfig::load(&config_path)?;
    init_logging(&config);

    if first_start {
        log::info!("Writing default config to {:?}", config_path);
        config.save(&config_path)?;
    }
    log::info!(
        "Lodestone backend {} started at {}",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().to_rfc3339()
    );

    let launcher = Launcher::with_defaults(root, config).await?;
    let served = launcher
        .serve_lines(tokio::io::stdin(), tokio::io::stdout())
        .await;
    launcher.shutdown().await;
    if let Err(e) = &served {
        log::error!("Connection closed with error: {:#}", e);
    }
    served
}
