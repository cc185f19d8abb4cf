use browser_locator::{BrowserSession, Config};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Extract a page's accessibility tree and optionally act on one element.
#[derive(Parser)]
#[command(name = "browser-locator")]
#[command(version)]
struct Cli {
    /// Page to open
    url: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    headful: bool,

    /// Encoded id (`frame-backend`) to act on after extraction
    #[arg(long, requires = "method")]
    act: Option<String>,

    /// Action method, e.g. click, fill, press
    #[arg(long)]
    method: Option<String>,

    /// Arguments passed to the action method
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Capture a screenshot with ids drawn over elements
    #[arg(long)]
    overlay: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if cli.headful {
        config.browser.headless = false;
    }
    if cli.overlay {
        config.extraction.render_overlay = true;
    }

    let mut session = BrowserSession::launch(config).await?;
    let report = session.navigate(&cli.url).await?;
    info!(
        "Page settled as {:?} after {:?} ({} requests outstanding)",
        report.state, report.elapsed, report.outstanding
    );

    let state = session.extract_tree().await?;
    info!(
        "Extracted {} nodes across {} frames",
        state.node_count(),
        state.frames.len()
    );
    println!("{}", state.tree);

    if let Some(overlay) = &state.overlay_base64 {
        info!("Overlay screenshot: {} base64 bytes", overlay.len());
    }

    if let (Some(id), Some(method)) = (&cli.act, &cli.method) {
        let result = session.resolve_and_dispatch(id, method, &cli.args).await?;
        if result.success {
            info!("{} on {}: {}", method, id, result.message);
        } else {
            error!("{} on {} failed: {}", method, id, result.message);
        }
        if let Some(data) = &result.data {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    }

    session.close().await?;
    Ok(())
}
