use clap::Parser;
use restcache_gpkg::{
    Filters, Gpkg, RestCache, RestCacheError, SpatialStore, SyncOptions, TransportConfig,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Copy an Esri REST feature service layer into a GeoPackage.
#[derive(Debug, Parser)]
#[command(name = "restcache", version)]
struct Args {
    /// Layer URL, e.g. https://host/arcgis/rest/services/Name/FeatureServer/0
    url: String,

    /// Destination GeoPackage. Created when it does not exist.
    gpkg: PathBuf,

    /// Destination layer name. Defaults to the service name.
    #[arg(long)]
    layer: Option<String>,

    /// `where` clause; repeat to sync several filters in order. Defaults to all records.
    #[arg(long = "where", value_name = "CLAUSE")]
    filters: Vec<String>,

    /// Keep existing rows instead of replacing them.
    #[arg(long)]
    append: bool,

    #[arg(long, env = "RESTCACHE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Drop the destination layer if it exists and create it again.
    #[arg(long)]
    create: bool,

    /// Destination-only field, left alone by the sync.
    #[arg(long = "user-field", value_name = "NAME")]
    user_fields: Vec<String>,

    /// Service field that is not copied.
    #[arg(long = "exclude-field", value_name = "NAME")]
    exclude_fields: Vec<String>,

    /// JSON file with transport settings.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    retry_delay_secs: Option<u64>,

    /// Retry without certificate verification after a certificate failure.
    #[arg(long)]
    allow_insecure_tls_fallback: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("restcache failed: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str::<TransportConfig>(&std::fs::read_to_string(path)?)?,
        None => TransportConfig::default(),
    };
    if let Some(max_attempts) = args.max_attempts {
        config = config.with_max_attempts(max_attempts);
    }
    if let Some(secs) = args.retry_delay_secs {
        config = config.with_retry_delay_secs(secs);
    }
    if args.allow_insecure_tls_fallback {
        config = config.with_insecure_tls_fallback(true);
    }

    ensure_gpkg_path(&args.gpkg)?;
    let cache = RestCache::builder(&args.url)
        .token(args.token)
        .user_fields(args.user_fields)
        .exclude_fields(args.exclude_fields.clone())
        .config(config)
        .build()?;

    let gpkg = if args.gpkg.exists() {
        Gpkg::open(&args.gpkg)?
    } else {
        Gpkg::new(&args.gpkg)?
    };

    let layer_name = args
        .layer
        .clone()
        .unwrap_or_else(|| cache.model().display_name().to_string());
    let exists = gpkg.list_layers()?.contains(&layer_name);
    if args.create && exists {
        gpkg.delete_layer(&layer_name)?;
    }
    let layer = if args.create || !exists {
        cache.create_destination(&gpkg, Some(&layer_name), &args.exclude_fields)?
    } else {
        layer_name
    };

    let filters = if args.filters.is_empty() {
        Filters::All
    } else {
        Filters::from(args.filters)
    };
    let options = SyncOptions::new()
        .with_filters(filters)
        .with_append(args.append);
    let report = cache.sync(&gpkg, &layer, &options)?;

    println!(
        "{}: {} rows written from {} pages ({} null geometries, {} invalid geometries skipped)",
        gpkg.location(),
        report.rows_written,
        report.pages_fetched,
        report.skipped_null_geometry,
        report.skipped_invalid_geometry,
    );
    Ok(())
}

/// Refuse destinations that are not `.gpkg` files before anything is created.
fn ensure_gpkg_path(path: &Path) -> Result<(), RestCacheError> {
    let is_gpkg = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gpkg"));
    if is_gpkg {
        Ok(())
    } else {
        Err(RestCacheError::IncorrectWorkspaceType {
            location: path.display().to_string(),
        })
    }
}
