//! # nblsp
//!
//! Command line front end for the nblsp document model.
//!
//! ## Quick Start
//!
//! ```bash
//! # Show how a notebook decomposes into virtual documents
//! cargo run -- inspect analysis.ipynb
//!
//! # Connect to the configured language servers and print diagnostics
//! cargo run -- connect analysis.ipynb --wait 5
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nblsp_core::editor::same_editor;
use nblsp_core::{
    Config, FileHost, HostDocument, NotebookHost, Position, UpdateManager, VirtualDocument,
};
use nblsp_features::{DiagnosticsFeature, builtin_registry};
use nblsp_lsp::{ConnectionManager, ConnectionPool, StdioConnector, WidgetAdapter, solve_uris};

/// nblsp - language servers for notebooks and embedded code
#[derive(Parser, Debug)]
#[command(name = "nblsp")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the virtual document tree of a file or notebook
    Inspect {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Connect a file or notebook to its language servers
    Connect {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Seconds to wait for diagnostics
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    tracing::info!("Starting nblsp v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    match args.command {
        Command::Inspect { path, json } => inspect(&path, &config, json).await,
        Command::Connect { path, wait } => connect(&path, config, Duration::from_secs(wait)).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn open_host(path: &Path, config: &Config) -> anyhow::Result<Arc<dyn HostDocument>> {
    let host: Arc<dyn HostDocument> = match path.extension().and_then(|ext| ext.to_str()) {
        Some("ipynb") => NotebookHost::open(path, config)?,
        _ => FileHost::open(path, config)?,
    };
    Ok(host)
}

fn depth(document: &VirtualDocument) -> usize {
    let mut depth = 0;
    let mut parent = document.parent();
    while let Some(document) = parent {
        depth += 1;
        parent = document.parent();
    }
    depth
}

/// Index of the host block owning `editor`.
fn block_index(host: &dyn HostDocument, editor: &nblsp_core::EditorRef) -> Option<usize> {
    host.blocks()
        .iter()
        .position(|block| same_editor(&block.editor, editor))
}

// ============================================================================
// inspect
// ============================================================================

/// One virtual document as printed by `inspect`.
#[derive(Debug, Serialize)]
struct DocumentReport {
    id_path: String,
    language: String,
    depth: usize,
    lines: usize,
    uri: String,
    server: String,
    blocks: Vec<BlockReport>,
}

#[derive(Debug, Serialize)]
struct BlockReport {
    virtual_start: usize,
    virtual_end: usize,
    /// Index of the host block, e.g. the notebook cell
    host_block: Option<usize>,
    origin: Position,
}

fn report(host: &dyn HostDocument, root: &VirtualDocument, config: &Config) -> anyhow::Result<Vec<DocumentReport>> {
    root.all_documents()
        .into_iter()
        .map(|document| {
            let uris = solve_uris(&document, &config.connection)?;
            Ok(DocumentReport {
                id_path: document.id_path(),
                language: document.language().to_string(),
                depth: depth(&document),
                lines: document.line_count(),
                uri: uris.document.as_str().to_string(),
                server: uris.server,
                blocks: document
                    .blocks()
                    .into_iter()
                    .map(|block| BlockReport {
                        virtual_start: block.virtual_start,
                        virtual_end: block.virtual_end(),
                        host_block: block_index(host, &block.editor),
                        origin: block.origin,
                    })
                    .collect(),
            })
        })
        .collect()
}

async fn inspect(path: &Path, config: &Config, json: bool) -> anyhow::Result<()> {
    let host = open_host(path, config)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let extractors = Arc::new(config.extractor_registry()?);
    let root = VirtualDocument::new(host.document_options(config, extractors));
    let updates = UpdateManager::new(root.clone());
    updates.update_documents(host.blocks()).await?;

    let documents = report(host.as_ref(), &root, config)?;
    updates.dispose();
    root.dispose();

    if json {
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }

    for document in documents {
        let indent = "  ".repeat(document.depth);
        println!(
            "{}{} [{}] {} lines",
            indent, document.id_path, document.language, document.lines
        );
        println!("{}  uri:    {}", indent, document.uri);
        println!("{}  server: {}", indent, document.server);
        for block in document.blocks {
            let owner = block
                .host_block
                .map(|index| format!("block {}", index))
                .unwrap_or_else(|| "?".to_string());
            println!(
                "{}  lines {}..{} <- {} at {}",
                indent, block.virtual_start, block.virtual_end, owner, block.origin
            );
        }
    }
    Ok(())
}

// ============================================================================
// connect
// ============================================================================

async fn connect(path: &Path, config: Config, wait: Duration) -> anyhow::Result<()> {
    let host = open_host(path, &config)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let connector = Arc::new(StdioConnector::from_config(&config));
    let pool = Arc::new(ConnectionPool::new(connector));
    let manager = ConnectionManager::new(pool.clone(), config.connection.clone());
    let adapter = WidgetAdapter::new(
        host.clone(),
        manager.clone(),
        Arc::new(builtin_registry()),
        config,
    )?;

    adapter.initialize().await?;
    tokio::time::sleep(wait).await;

    let Some(root) = adapter.document() else {
        anyhow::bail!("Document tree is gone");
    };
    for document in root.all_documents() {
        let id_path = document.id_path();
        let status = adapter
            .status(&id_path)
            .map(|status| format!("{:?}", status))
            .unwrap_or_else(|| "Pending".to_string());
        println!("{} [{}]: {}", id_path, document.language(), status);

        let Some(editor_adapter) = adapter.editor_adapter(&id_path) else {
            continue;
        };
        let Some(diagnostics) = editor_adapter.feature::<DiagnosticsFeature>() else {
            continue;
        };
        for diagnostic in diagnostics.diagnostics() {
            let block = block_index(host.as_ref(), &diagnostic.editor)
                .map(|index| index.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "  block {} {}: {:?} {}",
                block,
                diagnostic.start,
                diagnostic.severity,
                diagnostic.message
            );
        }
    }

    let ignored = manager.ignored_languages();
    if !ignored.is_empty() {
        println!("no server for: {}", ignored.join(", "));
    }

    adapter.dispose();
    manager.dispose();
    pool.shutdown().await;
    Ok(())
}
