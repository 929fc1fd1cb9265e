use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use irx_core::{DateRange, ValidationError};
use irx_export::{
    discover_collections, parse_delimiter, CollectionRegistry, ExportConfig, ExportError,
    ExportOptions, ExportSummary, Exporter, Layout, DEFAULT_COLLECTIONS_PAGE_URL,
};
use irx_storage::HttpFetcher;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "irx")]
#[command(about = "Export institutional repository collections to delimited files, JSON or SQLite")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags win over the `IRX_*` environment.
#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    page_size: Option<u64>,
    /// `|`, `tab`, `comma` or any single ASCII character.
    #[arg(long, global = true)]
    delimiter: Option<String>,
    #[arg(long, global = true)]
    collections_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Inclusive start, YYYY-MM-DD.
    #[arg(long, requires = "until")]
    from: Option<String>,
    /// Exclusive end, YYYY-MM-DD.
    #[arg(long, requires = "from")]
    until: Option<String>,
}

impl DateArgs {
    fn range(&self) -> Result<Option<DateRange>, ValidationError> {
        match (&self.from, &self.until) {
            (Some(from), Some(until)) => DateRange::parse(from, until).map(Some),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Args)]
struct LayoutArgs {
    /// Two columns: Title and a link to the item page.
    #[arg(long)]
    title_link: bool,
    /// One row per `;`-separated value of this column.
    #[arg(long)]
    explode: Option<String>,
    /// Output file name inside the output directory.
    #[arg(long)]
    output: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the configured collections.
    Collections,
    /// Export one collection by name or identifier.
    Export {
        collection: String,
        #[command(flatten)]
        dates: DateArgs,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Export every collection into one deduplicated file.
    ExportAll {
        #[command(flatten)]
        dates: DateArgs,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Dump the raw documents of one collection as JSON.
    Json {
        collection: String,
        #[command(flatten)]
        dates: DateArgs,
    },
    /// Build the SQLite database and its metadata.json.
    Database {
        #[command(flatten)]
        dates: DateArgs,
    },
    /// Count values of a multi-valued field.
    Facets {
        field: String,
        /// Limit to one collection; all collections otherwise.
        #[arg(long)]
        collection: Option<String>,
        #[arg(long, default_value_t = 25)]
        top: usize,
        #[command(flatten)]
        dates: DateArgs,
    },
    /// Scrape the repository's collection list.
    Discover {
        #[arg(long, default_value = DEFAULT_COLLECTIONS_PAGE_URL)]
        url: String,
        /// Write the discovered map as a collections registry.
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_config(overrides: &ConfigOverrides) -> Result<ExportConfig> {
    let mut config = ExportConfig::from_env();
    if let Some(api_url) = &overrides.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(output_dir) = &overrides.output_dir {
        config.output_dir = output_dir.clone();
    }
    if let Some(page_size) = overrides.page_size {
        config.page_size = page_size;
    }
    if let Some(delimiter) = &overrides.delimiter {
        config.delimiter = parse_delimiter(delimiter)?;
    }
    if let Some(path) = &overrides.collections_file {
        config.collections_file = path.clone();
    }
    Ok(config)
}

fn export_options(dates: &DateArgs, layout: &LayoutArgs) -> Result<ExportOptions> {
    Ok(ExportOptions {
        date_range: dates.range()?,
        layout: if layout.title_link {
            Layout::TitleLink
        } else {
            Layout::Fields
        },
        explode: layout.explode.clone(),
        file_name: layout.output.clone(),
    })
}

fn failed(err: ExportError) -> anyhow::Error {
    let kind = err.kind();
    anyhow::Error::new(err).context(format!("{kind} failure"))
}

fn print_summary(summary: &ExportSummary) {
    println!(
        "export complete: run_id={} collections={} pages={} rows={} duplicates={} path={} sha256={}",
        summary.run_id,
        summary.collections.len(),
        summary.pages_fetched,
        summary.rows_written,
        summary.rows_before_dedupe - summary.rows_written,
        summary.output_path,
        summary.output_sha256
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(&cli.overrides)?;

    if let Commands::Discover { url, write } = &cli.command {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let map = discover_collections(&fetcher, url).await.map_err(failed)?;
        for entry in map.iter() {
            println!("{}\t{}", entry.id, entry.name);
        }
        if let Some(path) = write {
            let yaml = CollectionRegistry::from_map(&map).to_yaml()?;
            std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {} collections to {}", map.len(), path.display());
        }
        return Ok(());
    }

    let exporter = Exporter::from_config(config).await?;
    match cli.command {
        Commands::Collections => {
            for entry in exporter.collections().iter() {
                println!("{}\t{}\t{}", entry.id, entry.slug(), entry.name);
            }
        }
        Commands::Export {
            collection,
            dates,
            layout,
        } => {
            let options = export_options(&dates, &layout)?;
            let summary = exporter
                .export_collection(&collection, &options)
                .await
                .map_err(failed)?;
            print_summary(&summary);
        }
        Commands::ExportAll { dates, layout } => {
            let options = export_options(&dates, &layout)?;
            let summary = exporter.export_all(&options).await.map_err(failed)?;
            print_summary(&summary);
        }
        Commands::Json { collection, dates } => {
            let summary = exporter
                .export_json(&collection, dates.range()?.as_ref())
                .await
                .map_err(failed)?;
            print_summary(&summary);
        }
        Commands::Database { dates } => {
            let summary = exporter
                .export_database(dates.range()?.as_ref())
                .await
                .map_err(failed)?;
            for table in &summary.tables {
                println!("{}\t{}", table.name, table.rows);
            }
            println!(
                "database complete: run_id={} path={} metadata={}",
                summary.run_id, summary.database_path, summary.metadata_path
            );
        }
        Commands::Facets {
            field,
            collection,
            top,
            dates,
        } => {
            let counts = exporter
                .facet_counts(collection.as_deref(), &field, dates.range()?.as_ref())
                .await
                .map_err(failed)?;
            for facet in counts.iter().take(top) {
                println!("{}\t{}", facet.count, facet.value);
            }
        }
        Commands::Discover { .. } => {}
    }

    Ok(())
}
