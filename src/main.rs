use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use prompt_cluster::logging::{self, LogTarget};
use prompt_cluster::store::{
    ClusterSession, ClusterStore, ScanMode, SqliteStore, StoreKey, ENGINE_VERSION,
};
use prompt_cluster::{position_in_cluster, Config, ImageRecord, MatchKind, RebuildManager};

/// How often the build loop polls the rebuild worker.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Command {
    Build { records: PathBuf },
    Add { record: PathBuf },
    Remove { ids: Vec<String> },
    Show { image: Option<String> },
    List,
}

struct Args {
    command: Command,
    directory: Option<String>,
    scan_mode: ScanMode,
    threshold: Option<f64>,
    config_path: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut positional = Vec::new();
    let mut directory = None;
    let mut scan_mode = ScanMode::Recursive;
    let mut threshold = None;
    let mut config_path = None;
    let mut image = None;
    let mut verbose = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("prompt-cluster {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--verbose" | "-v" => verbose = true,
            "--flat" => scan_mode = ScanMode::Flat,
            "--dir" | "-d" => {
                directory = Some(value_of(&args, i, "--dir")?.to_string());
                i += 1;
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(value_of(&args, i, "--config")?));
                i += 1;
            }
            "--threshold" | "-t" => {
                let raw = value_of(&args, i, "--threshold")?;
                threshold = Some(
                    raw.parse::<f64>()
                        .with_context(|| format!("Invalid threshold: {}", raw))?,
                );
                i += 1;
            }
            "--image" | "-i" => {
                image = Some(value_of(&args, i, "--image")?.to_string());
                i += 1;
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                bail!("Unknown argument: {}", flag);
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("build") => Command::Build {
            records: PathBuf::from(positional.next().context("build requires a records file")?),
        },
        Some("add") => Command::Add {
            record: PathBuf::from(positional.next().context("add requires a record file")?),
        },
        Some("remove") => {
            let ids: Vec<String> = positional.by_ref().collect();
            if ids.is_empty() {
                bail!("remove requires at least one image id");
            }
            Command::Remove { ids }
        }
        Some("show") => Command::Show { image },
        Some("list") => Command::List,
        Some(other) => bail!("Unknown command: {}", other),
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    if let Some(extra) = positional.next() {
        bail!("Unexpected argument: {}", extra);
    }

    Ok(Args {
        command,
        directory,
        scan_mode,
        threshold,
        config_path,
        verbose,
    })
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    match args.get(i + 1) {
        Some(value) => Ok(value),
        None => bail!("{} requires a value", flag),
    }
}

fn print_help() {
    println!(
        r#"prompt-cluster - Group AI-generated images by prompt similarity

USAGE:
    prompt-cluster build <records.json> [OPTIONS]
    prompt-cluster add <record.json> [OPTIONS]
    prompt-cluster remove <id>... [OPTIONS]
    prompt-cluster show [--image ID] [OPTIONS]
    prompt-cluster list [OPTIONS]

OPTIONS:
    --dir, -d DIR           Library directory the clusters belong to (default: current)
    --flat                  Use the flat (non-recursive) scan cache
    --threshold, -t T       Similarity threshold in (0, 1] (overrides config)
    --image, -i ID          With show: print only the cluster holding ID
    --config, -c PATH       Path to config file
    --verbose, -v           Log to stderr
    --version, -V           Show version
    --help, -h              Show this help message

Records are JSON objects with "id", "prompt" and "lastModified" (epoch ms).
build takes an array of them, add takes a single one. list prints every
cached cluster set.

ENVIRONMENT:
    PROMPT_CLUSTER_CONFIG   Path to config file (overrides default location)
    PROMPT_CLUSTER_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/prompt-cluster/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let target = if args.verbose {
        LogTarget::Stderr
    } else {
        LogTarget::System { log_dir: None }
    };
    if let Err(e) = logging::init(target) {
        eprintln!("Warning: logging unavailable: {}", e);
    }

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(threshold) = args.threshold {
        config.clustering.similarity_threshold = threshold;
    }
    let options = config.clustering.to_options();
    options.validate()?;

    let directory = match args.directory {
        Some(dir) => dir,
        None => std::env::current_dir()?.display().to_string(),
    };
    let key = StoreKey::new(directory, args.scan_mode);

    let sqlite = Arc::new(SqliteStore::open(&config.cache.path)?);
    if let Command::List = args.command {
        return run_list(&sqlite);
    }
    let store: Arc<dyn ClusterStore> = sqlite;
    let session = ClusterSession::new(store, key, options);

    match args.command {
        Command::Build { records } => run_build(session, &records).await,
        Command::Add { record } => run_add(&session, &record),
        Command::Remove { ids } => run_remove(&session, &ids),
        Command::Show { image } => run_show(&session, image.as_deref()),
        Command::List => Ok(()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn run_build(session: ClusterSession, records: &Path) -> Result<()> {
    let images: Vec<ImageRecord> = read_json(records)?;
    info!(key = %session.key(), images = images.len(), "Starting build");

    let mut manager = RebuildManager::new();
    let id = manager.start_rebuild(session, images)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            result = &mut ctrl_c, if !cancel_requested => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                eprintln!("\nCancelling...");
                manager.cancel_task(id);
                cancel_requested = true;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        if let Some(done) = manager.poll_updates().into_iter().next() {
            eprintln!();
            if done.success() {
                println!("{}", done.message);
                return Ok(());
            }
            bail!("Build for {} did not complete: {}", done.key, done.message);
        }

        if let Some(task) = manager.running_tasks().first() {
            if let Some(progress) = task.progress {
                eprint!(
                    "\r{:<28} {:>3}%  {:>5.1}s",
                    progress.phase.display_name(),
                    progress.percent(),
                    task.elapsed().as_secs_f64()
                );
            }
        }
    }
}

fn run_add(session: &ClusterSession, record: &Path) -> Result<()> {
    let image: ImageRecord = read_json(record)?;
    let classification = session.add_image(&image)?;

    match classification.kind {
        MatchKind::NoPrompt => println!("{}: no prompt, not clustered", image.id),
        MatchKind::AlreadyPresent => {
            println!("{}: already in {}", image.id, classification.cluster_id)
        }
        MatchKind::Exact => println!("{}: exact match {}", image.id, classification.cluster_id),
        MatchKind::Similar { score } => println!(
            "{}: similar to {} (score {:.3})",
            image.id, classification.cluster_id, score
        ),
        MatchKind::New => println!("{}: new cluster {}", image.id, classification.cluster_id),
    }
    Ok(())
}

fn run_remove(session: &ClusterSession, ids: &[String]) -> Result<()> {
    let outcome = session.remove_images(ids)?;
    println!(
        "Removed {} images, {} clusters emptied, {} clusters remain",
        outcome.removed_images,
        outcome.removed_clusters,
        outcome.clusters.len()
    );
    Ok(())
}

fn run_show(session: &ClusterSession, image: Option<&str>) -> Result<()> {
    let Some(set) = session.load_valid()? else {
        bail!("No valid clusters cached for {}; run build first", session.key());
    };

    if let Some(image_id) = image {
        for cluster in &set.clusters {
            if let Some(position) = position_in_cluster(image_id, cluster) {
                println!(
                    "{} is #{} of {} in {} \"{}\"",
                    image_id,
                    position + 1,
                    cluster.size(),
                    short_id(cluster.id()),
                    cluster.base_prompt()
                );
                return Ok(());
            }
        }
        bail!("{} is not in any cluster", image_id);
    }

    println!(
        "{}: {} clusters, {} images (threshold {})",
        session.key(),
        set.clusters.len(),
        set.image_count(),
        set.similarity_threshold
    );
    for cluster in &set.clusters {
        println!(
            "{}  {:>5}  cover={}  {}",
            short_id(cluster.id()),
            cluster.size(),
            cluster.cover_image_id(),
            cluster.base_prompt()
        );
    }
    Ok(())
}

fn run_list(store: &SqliteStore) -> Result<()> {
    let keys = store.keys()?;
    if keys.is_empty() {
        println!("No cached cluster sets");
        return Ok(());
    }
    for (key, version, clusters) in keys {
        let note = if version == ENGINE_VERSION {
            ""
        } else {
            "  (stale, rebuild required)"
        };
        println!("{}: {} clusters{}", key, clusters, note);
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
