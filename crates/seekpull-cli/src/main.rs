//! seekpull: random access into gzip-compressed tar layers
//!
//! Commands:
//!   index <layer.tar.gz> -o <out.ztoc>           - build a span index + TOC
//!   info <out.ztoc> [--json] [--list]            - describe an index
//!   extract <ztoc> <path> --layer|--url <src>    - pull one file lazily
//!   check <url>                                  - resolve and probe a blob URL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use seekpull_core::config::SeekpullConfig;
use seekpull_core::ReadAt;
use seekpull_remote::{Blob, Transport};
use seekpull_ztoc::{build_index, build_ztoc, LocalFile, Ztoc};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "seekpull",
    version,
    about = "Random access into gzip-compressed tar layers",
    long_about = "seekpull: index gzip layers at DEFLATE block boundaries and pull single files \
                  from local or remote layers without downloading them whole"
)]
struct Cli {
    /// Path to seekpull.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SEEKPULL_CONFIG",
        default_value = "/etc/seekpull/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "SEEKPULL_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "SEEKPULL_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a ztoc (span index + table of contents) for a gzip layer
    Index {
        /// gzip-compressed tar layer
        layer: PathBuf,
        /// Where to write the ztoc
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Uncompressed bytes per span (default: [index] span_size)
        #[arg(long)]
        span_size: Option<u64>,
        /// Index a plain gzip stream without parsing it as tar
        #[arg(long)]
        no_toc: bool,
    },

    /// Describe a ztoc
    Info {
        ztoc: PathBuf,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
        /// Include every table-of-contents entry
        #[arg(long)]
        list: bool,
    },

    /// Extract one file from a layer using its ztoc
    Extract {
        ztoc: PathBuf,
        /// Path of the file inside the layer
        path: String,
        /// Read the layer from a local file
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        layer: Option<PathBuf>,
        /// Read the layer over HTTP
        #[arg(long)]
        url: Option<String>,
        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Resolve a blob URL and probe it
    Check {
        url: String,
        /// Never send multi-range requests
        #[arg(long)]
        single_range: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(version = env!("CARGO_PKG_VERSION"), "seekpull starting");

    match cli.command {
        Commands::Index {
            layer,
            output,
            span_size,
            no_toc,
        } => {
            let span_size = span_size.unwrap_or(config.index.span_size);
            cmd_index(&layer, &output, span_size, no_toc)
        }
        Commands::Info { ztoc, json, list } => cmd_info(&ztoc, json, list),
        Commands::Extract {
            ztoc,
            path,
            layer,
            url,
            output,
        } => cmd_extract(&config, &ztoc, &path, layer, url, output.as_deref()).await,
        Commands::Check { url, single_range } => {
            let mut config = config;
            config.fetch.force_single_range |= single_range;
            cmd_check(&config, &url).await
        }
    }
}

fn load_config(path: &Path) -> Result<(SeekpullConfig, bool)> {
    if path.exists() {
        let config = seekpull_core::config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((SeekpullConfig::default(), false))
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout may carry extracted file data
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

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn make_spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn transport() -> Result<Arc<dyn Transport>> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("seekpull/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;
    Ok(Arc::new(client))
}

fn read_ztoc(path: &Path) -> Result<Ztoc> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ztoc::from_bytes(&bytes).with_context(|| format!("parsing ztoc {}", path.display()))
}

// ── `seekpull index` ───────────────────────────────────────────────────────────

fn cmd_index(layer: &Path, output: &Path, span_size: u64, no_toc: bool) -> Result<()> {
    let file =
        std::fs::File::open(layer).with_context(|| format!("opening {}", layer.display()))?;
    let len = file.metadata()?.len();

    let pb = make_progress_bar(len, "index")?;
    let reader = pb.wrap_read(std::io::BufReader::new(file));
    let ztoc = if no_toc {
        Ztoc::without_toc(build_index(reader, span_size)?)
    } else {
        build_ztoc(reader, span_size)?
    };
    pb.finish_and_clear();

    let bytes = ztoc.to_bytes();
    std::fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;

    info!(
        layer = %layer.display(),
        spans = ztoc.index.span_count(),
        entries = ztoc.toc.len(),
        "index written"
    );
    println!(
        "{}  {} spans, {} entries, {} -> {} bytes",
        ztoc.digest(),
        ztoc.index.span_count(),
        ztoc.toc.len(),
        ztoc.index.compressed_size(),
        ztoc.index.uncompressed_size(),
    );
    println!("wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

// ── `seekpull info` ────────────────────────────────────────────────────────────

fn cmd_info(path: &Path, json: bool, list: bool) -> Result<()> {
    let ztoc = read_ztoc(path)?;
    let index = &ztoc.index;

    if json {
        let spans: Vec<_> = index
            .checkpoints()
            .iter()
            .map(|c| {
                serde_json::json!({
                    "span_id": c.span_id,
                    "compressed_offset": c.compressed_offset,
                    "bit_offset": c.bit_offset,
                    "uncompressed_offset": c.uncompressed_offset,
                })
            })
            .collect();
        let mut out = serde_json::json!({
            "digest": ztoc.digest().to_hex().to_string(),
            "span_size": index.span_size(),
            "compressed_size": index.compressed_size(),
            "uncompressed_size": index.uncompressed_size(),
            "spans": spans,
            "entries": ztoc.toc.len(),
        });
        if list {
            out["toc"] = serde_json::to_value(&ztoc.toc)?;
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("digest:            {}", ztoc.digest());
    println!("span size:         {}", index.span_size());
    println!("compressed size:   {}", index.compressed_size());
    println!("uncompressed size: {}", index.uncompressed_size());
    println!("spans:             {}", index.span_count());
    println!("entries:           {}", ztoc.toc.len());
    if list {
        for e in &ztoc.toc {
            let link = e
                .link_name
                .as_deref()
                .map(|l| format!(" -> {l}"))
                .unwrap_or_default();
            let kind = format!("{:?}", e.kind).to_lowercase();
            println!(
                "{kind:<8} {:>6o} {:>12} [{}..={}] {}{link}",
                e.mode, e.uncompressed_size, e.span_start, e.span_end, e.path
            );
        }
    }
    Ok(())
}

// ── `seekpull extract` ─────────────────────────────────────────────────────────

async fn cmd_extract(
    config: &SeekpullConfig,
    ztoc_path: &Path,
    path: &str,
    layer: Option<PathBuf>,
    url: Option<String>,
    output: Option<&Path>,
) -> Result<()> {
    let ztoc = read_ztoc(ztoc_path)?;

    let data = match (layer, url) {
        (Some(layer), _) => {
            let file = LocalFile::open(&layer)
                .with_context(|| format!("opening {}", layer.display()))?;
            check_layer_size(&ztoc, file.size())?;
            extract_from(&ztoc, &file, path).await?
        }
        (None, Some(url)) => {
            let url = url.parse().with_context(|| format!("invalid URL {url}"))?;
            let blob = Blob::connect(transport()?, url, config.fetch.clone()).await?;
            check_layer_size(&ztoc, blob.size())?;
            let data = extract_from(&ztoc, &blob, path).await;
            info!(
                url = %blob.url(),
                fetched = blob.fetched_size(),
                size = blob.size(),
                "remote extract done"
            );
            blob.close();
            data?
        }
        (None, None) => anyhow::bail!("one of --layer or --url is required"),
    };

    match output {
        Some(out) => {
            std::fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;
            eprintln!("{path}: {} bytes -> {}", data.len(), out.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn check_layer_size(ztoc: &Ztoc, actual: u64) -> Result<()> {
    let expected = ztoc.index.compressed_size();
    if actual != expected {
        anyhow::bail!("layer is {actual} bytes but the ztoc was built for {expected} bytes");
    }
    Ok(())
}

async fn extract_from<R: ReadAt>(ztoc: &Ztoc, reader: &R, path: &str) -> Result<Vec<u8>> {
    let spinner = make_spinner("extract")?;
    spinner.set_message(path.to_string());
    let result = ztoc.extract_file(reader, path).await;
    spinner.finish_and_clear();
    result.with_context(|| format!("extracting {path}"))
}

// ── `seekpull check` ───────────────────────────────────────────────────────────

async fn cmd_check(config: &SeekpullConfig, url: &str) -> Result<()> {
    let url = url.parse().with_context(|| format!("invalid URL {url}"))?;
    let blob = Blob::connect(transport()?, url, config.fetch.clone()).await?;
    blob.check().await.context("probing blob")?;
    println!("ok  {} bytes  {}", blob.size(), blob.url());
    blob.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "seekpull",
            "index",
            "layer.tar.gz",
            "-o",
            "layer.ztoc",
            "--span-size",
            "65536",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Index {
                span_size: Some(65536),
                no_toc: false,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["seekpull", "info", "x.ztoc", "--json", "--list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Info {
                json: true,
                list: true,
                ..
            }
        ));
    }

    #[test]
    fn extract_needs_exactly_one_source() {
        assert!(Cli::try_parse_from(["seekpull", "extract", "x.ztoc", "etc/hosts"]).is_err());
        assert!(Cli::try_parse_from([
            "seekpull",
            "extract",
            "x.ztoc",
            "etc/hosts",
            "--layer",
            "l.tar.gz",
            "--url",
            "http://registry/blob",
        ])
        .is_err());
        assert!(
            Cli::try_parse_from(["seekpull", "extract", "x.ztoc", "a", "--url", "http://r/b"])
                .is_ok()
        );
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, found) = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(!found);
        assert_eq!(config.index.span_size, seekpull_core::config::DEFAULT_SPAN_SIZE);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seekpull.toml");
        std::fs::write(&path, "[index]\nspan_size = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
