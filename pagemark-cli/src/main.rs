mod viewer;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pagemark_core::persistence::LogNotifier;
use pagemark_core::{
    AnnotationRecord, AnnotationStore, CanvasLayerManager, DocumentLoaded, EditorEffect,
    FileBlobStore, FileMetaStore, LoadOutcome, MetaStore, Point, PointerEvent, RecordCommand,
    RemoteSync, RestoreOutcome, Rotation, SharedStore, Style, Subtype, SyncConfig, SyncEngine,
    SyncPorts, Viewer, Viewport,
};
use pagemark_remote::{HttpDocumentFetcher, HttpRemote};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::viewer::{HeadlessViewer, TextSurface};

#[derive(Debug, Parser)]
#[command(
    name = "pagemark",
    version,
    about = "Headless host for the pagemark annotation sync engine"
)]
struct Args {
    /// Directory for the document cache, state and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to config.toml in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remote annotation endpoint, overrides the config file
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Sync user and author of new annotations
    #[arg(long, global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Open a document (path or URL) and load its annotations
    Open {
        source: String,

        /// JSON array of annotation records to add after loading
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// Draw one annotation with a pointer gesture in screen coordinates
    Draw {
        source: String,

        #[arg(long, value_parser = parse_subtype)]
        subtype: Subtype,

        /// Page number (1-based)
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Pointer positions as `x,y`; the first is the press, the last the release
        #[arg(long = "at", value_parser = parse_point, required = true)]
        points: Vec<Point>,

        #[arg(long, default_value_t = 1.0)]
        scale: f64,

        /// Page rotation in degrees (0, 90, 180, 270)
        #[arg(long, default_value_t = 0)]
        rotation: i32,

        #[arg(long, default_value_t = 612.0)]
        page_width: f64,

        #[arg(long, default_value_t = 792.0)]
        page_height: f64,

        #[arg(long)]
        color: Option<String>,

        /// Text contents of the new annotation
        #[arg(long)]
        text: Option<String>,
    },
    /// Reopen the last document from the local cache
    Restore {
        /// Document to open when nothing could be restored
        #[arg(long)]
        fallback: Option<String>,
    },
    /// Restore the last document and print its annotations as JSON
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_subtype(raw: &str) -> Result<Subtype, String> {
    let subtype: Subtype = serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|err| err.to_string())?;
    if subtype == Subtype::Other {
        return Err(format!("unknown annotation type {raw:?}"));
    }
    Ok(subtype)
}

fn parse_point(raw: &str) -> Result<Point, String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected `x,y`, got {raw:?}"))?;
    let x = x.trim().parse::<f64>().map_err(|err| err.to_string())?;
    let y = y.trim().parse::<f64>().map_err(|err| err.to_string())?;
    Ok(Point::new(x, y))
}

struct Host {
    store: SharedStore,
    engine: SyncEngine,
    viewer: Arc<HeadlessViewer>,
    meta: Arc<FileMetaStore>,
    events: mpsc::UnboundedReceiver<DocumentLoaded>,
    synced: bool,
}

impl Host {
    fn start(data_dir: &Path, config: &SyncConfig) -> Result<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        let fetcher = HttpDocumentFetcher::new(config.http_timeout());
        let viewer = Arc::new(HeadlessViewer::new(fetcher.clone(), sender));
        let meta = Arc::new(FileMetaStore::new(data_dir.join("state"))?);
        let remote = HttpRemote::from_config(config)?
            .map(|remote| Arc::new(remote) as Arc<dyn RemoteSync>);
        let synced = remote.is_some();
        let ports = SyncPorts {
            remote,
            blobs: Arc::new(FileBlobStore::open(data_dir.join("documents"))?),
            meta: meta.clone(),
            viewer: viewer.clone(),
            fetcher: Some(Arc::new(fetcher)),
            notifier: Arc::new(LogNotifier),
        };
        let store = AnnotationStore::shared();
        let engine = SyncEngine::new(Arc::clone(&store), ports, config)?;
        Ok(Self {
            store,
            engine,
            viewer,
            meta,
            events,
            synced,
        })
    }

    async fn next_load(&mut self) -> Result<LoadOutcome> {
        let event = self
            .events
            .recv()
            .await
            .ok_or_else(|| anyhow!("viewer stopped reporting document loads"))?;
        info!(url = %event.url, fingerprint = %event.fingerprint, "document loaded");
        self.engine.on_document_loaded(event).await
    }

    async fn open(&mut self, source: &str) -> Result<LoadOutcome> {
        self.viewer.close().await?;
        self.viewer
            .open_source(source)
            .await
            .with_context(|| format!("failed to open {source}"))?;
        self.next_load().await
    }

    async fn restore(&mut self) -> Result<RestoreOutcome> {
        match self.meta.get_meta().await {
            Ok(Some(info)) => self.viewer.remember_origin(&info),
            Ok(None) => {}
            Err(err) => warn!(?err, "failed to read last document info"),
        }
        let outcome = self.engine.restore_on_startup().await;
        if matches!(
            outcome,
            RestoreOutcome::FromCache(_) | RestoreOutcome::FromUrl(_)
        ) {
            self.next_load().await?;
        }
        Ok(outcome)
    }

    async fn save(&self) -> Result<()> {
        if self.synced {
            self.engine.save_now().await
        } else {
            warn!("no sync endpoint configured, annotations are kept in memory only");
            Ok(())
        }
    }

    fn report(&self, outcome: LoadOutcome) {
        let Some(doc) = self.engine.current_document() else {
            println!("{outcome:?}");
            return;
        };
        let title = doc.title.unwrap_or_default();
        match outcome {
            LoadOutcome::Loaded { records } => {
                println!("{}\t{}\t{} annotations", doc.fingerprint, title, records)
            }
            LoadOutcome::FetchFailed => {
                println!("{}\t{}\tannotations unavailable", doc.fingerprint, title)
            }
            other => println!("{}\t{}\t{:?}", doc.fingerprint, title, other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => SyncConfig::project_dirs()
            .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?
            .data_local_dir()
            .to_path_buf(),
    };
    let _log_guard = init_logging(&data_dir)?;
    let config = load_config(&args)?;

    let mut host = Host::start(&data_dir, &config)?;
    let result = run(&mut host, args.command, &config).await;
    host.engine.shutdown().await;
    result
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let path = args.config.clone().or_else(SyncConfig::default_path);
    let mut config = match path {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::default(),
    };
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(host: &mut Host, action: Action, config: &SyncConfig) -> Result<()> {
    match action {
        Action::Open { source, import } => {
            let outcome = host.open(&source).await?;
            host.report(outcome);
            if let Some(path) = import {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {:?}", path))?;
                let records: Vec<AnnotationRecord> = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to decode annotations in {:?}", path))?;
                let count = records.len();
                {
                    let mut store = host.store.lock();
                    for record in records {
                        store.add(record)?;
                    }
                }
                println!("imported {count} annotations");
                host.save().await?;
            }
        }
        Action::Draw {
            source,
            subtype,
            page,
            points,
            scale,
            rotation,
            page_width,
            page_height,
            color,
            text,
        } => {
            let outcome = host.open(&source).await?;
            host.report(outcome);

            let rotation = Rotation::from_degrees(rotation)?;
            let viewport = Viewport::new(scale, rotation, page_width, page_height)?;
            info!(page, rotation = rotation.degrees(), scale, "rendering page");
            let layers =
                CanvasLayerManager::attach(Arc::clone(&host.store), config.username.clone());
            let surface = Box::new(TextSurface::new(page));
            let hydrated = layers.on_page_rendered(page, surface, viewport, false);
            info!(page, drawn = hydrated.drawn, skipped = hydrated.skipped, "page mounted");

            let mut style = Style::default();
            if let Some(color) = color {
                style.color = color;
            }
            layers.arm_tool(subtype, style)?;

            let (first, rest) = points
                .split_first()
                .ok_or_else(|| anyhow!("at least one pointer position is required"))?;
            let last = rest.last().unwrap_or(first);
            if !layers.pointer_down(page, &PointerEvent::at(first.x, first.y)) {
                return Err(anyhow!("page {page} did not accept the gesture"));
            }
            for point in rest.iter().take(rest.len().saturating_sub(1)) {
                layers.pointer_move(page, &PointerEvent::at(point.x, point.y));
            }
            let effect = layers.pointer_up(page, &PointerEvent::at(last.x, last.y))?;
            layers.detach();

            match effect {
                Some(EditorEffect::Create(record)) => {
                    if let Some(text) = text {
                        host.store.lock().apply(RecordCommand::SetText {
                            id: record.id.clone(),
                            text,
                        })?;
                    }
                    println!("created {} {:?} on page {}", record.id, record.subtype, page);
                    host.save().await?;
                }
                _ => println!("nothing drawn"),
            }
        }
        Action::Restore { fallback } => {
            let outcome = host.restore().await?;
            match &outcome {
                RestoreOutcome::FromCache(fingerprint) => {
                    println!("restored {fingerprint} from cache")
                }
                RestoreOutcome::FromUrl(fingerprint) => {
                    println!("restored {fingerprint} from its url")
                }
                RestoreOutcome::NothingToRestore => println!("nothing to restore"),
                RestoreOutcome::Abandoned => println!("restore abandoned"),
            }
            let restored = matches!(
                outcome,
                RestoreOutcome::FromCache(_) | RestoreOutcome::FromUrl(_)
            );
            if !restored {
                if let Some(source) = fallback {
                    let outcome = host.open(&source).await?;
                    host.report(outcome);
                }
            }
        }
        Action::Export { output } => {
            host.restore().await?;
            let payload = serde_json::to_string_pretty(&host.store.lock().snapshot())?;
            match output {
                Some(path) => fs::write(&path, payload)
                    .with_context(|| format!("failed to write {:?}", path))?,
                None => println!("{payload}"),
            }
        }
    }
    Ok(())
}

fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagemark.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
