use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use ckan_migrator::app::{App, ArtifactPaths, ReplayOptions};
use ckan_migrator::catalog::CkanHttpClient;
use ckan_migrator::config::{CatalogRole, ConfigLoader, ResolvedConfig};
use ckan_migrator::error::MigrateError;
use ckan_migrator::log::TracingLog;
use ckan_migrator::output::{OutputMode, print_report};

#[derive(Parser)]
#[command(name = "ckan-migrate")]
#[command(about = "Migrate datasets, groups and tags between two CKAN catalogs")]
#[command(version, author)]
struct Cli {
    /// Configuration file (defaults to ./config.json).
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true, default_value = "migration.log")]
    log_file: String,

    /// Skip TLS certificate verification for every catalog.
    #[arg(long, global = true)]
    insecure: bool,

    /// Print step reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    #[arg(long, global = true)]
    roster: Option<String>,
    #[arg(long, global = true)]
    city_datasets: Option<String>,
    #[arg(long, global = true)]
    group_export: Option<String>,
    #[arg(long, global = true)]
    dataset_tags: Option<String>,
    #[arg(long, global = true)]
    tag_list: Option<String>,
}

impl PathArgs {
    fn resolve(self) -> ArtifactPaths {
        let defaults = ArtifactPaths::default();
        ArtifactPaths {
            roster: self.roster.map(Utf8PathBuf::from).unwrap_or(defaults.roster),
            city_datasets: self
                .city_datasets
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.city_datasets),
            group_export: self
                .group_export
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.group_export),
            dataset_tags: self
                .dataset_tags
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.dataset_tags),
            tag_list: self
                .tag_list
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.tag_list),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search the source catalog for each roster city and write city -> datasets")]
    CityDatasets,
    #[command(about = "Export source groups with their member datasets")]
    ExportGroups(CatalogArgs),
    #[command(about = "Invert the group export into dataset -> tags")]
    TagMap,
    #[command(about = "Create target groups per city and attach their datasets")]
    Materialize(ReplayArgs),
    #[command(about = "Replace target dataset tags from the dataset -> tags file")]
    PatchTags(ReplayArgs),
    #[command(about = "Write a catalog's tag list to the tag list file")]
    ListTags(TargetCatalogArgs),
    #[command(about = "Delete every tag named in the tag list file")]
    DeleteTags(DeleteArgs),
    #[command(about = "Run the full pipeline: cities, groups, export, tag map, tag patch")]
    Run(ReplayArgs),
}

#[derive(Args)]
struct CatalogArgs {
    #[arg(long, value_enum, default_value = "source")]
    catalog: CatalogRole,
}

#[derive(Args)]
struct TargetCatalogArgs {
    #[arg(long, value_enum, default_value = "target")]
    catalog: CatalogRole,
}

#[derive(Args)]
struct ReplayArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct DeleteArgs {
    #[arg(long, value_enum, default_value = "target")]
    catalog: CatalogRole,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MigrateError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MigrateError) -> u8 {
    if error.is_configuration() {
        2
    } else if error.is_catalog() {
        3
    } else {
        1
    }
}

fn init_logging(log_file: &str) {
    let path = Utf8PathBuf::from(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    let file_name = path.file_name().unwrap_or("migration.log").to_string();
    let appender = tracing_appender::rolling::never(directory.as_std_path(), file_name);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(appender),
        )
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_file);

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if cli.insecure {
        config.disable_tls_verification();
    }
    tracing::info!("Loaded configuration file");

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let paths = cli.paths.resolve();
    let log = TracingLog;

    match cli.command {
        Commands::CityDatasets => {
            let app = App::new(paths, ReplayOptions::default(), &log);
            let source = client_for(&config, CatalogRole::Source)?;
            let report = app.city_datasets(&source)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::ExportGroups(args) => {
            let app = App::new(paths, ReplayOptions::default(), &log);
            let source = client_for(&config, args.catalog)?;
            let report = app.export_groups(&source)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::TagMap => {
            let app = App::new(paths, ReplayOptions::default(), &log);
            let report = app.tag_map()?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::Materialize(args) => {
            let app = App::new(paths, replay_options(args.dry_run), &log);
            let target = client_for(&config, CatalogRole::Target)?;
            let report = app.materialize(&target)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::PatchTags(args) => {
            let app = App::new(paths, replay_options(args.dry_run), &log);
            let target = client_for(&config, CatalogRole::Target)?;
            let report = app.patch_tags(&target)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::ListTags(args) => {
            let app = App::new(paths, ReplayOptions::default(), &log);
            let client = client_for(&config, args.catalog)?;
            let report = app.list_tags(&client)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::DeleteTags(args) => {
            let app = App::new(paths, replay_options(args.dry_run), &log);
            let client = client_for(&config, args.catalog)?;
            let report = app.delete_tags(&client)?;
            print_report(&report, output_mode).into_diagnostic()
        }
        Commands::Run(args) => {
            let app = App::new(paths, replay_options(args.dry_run), &log);
            let source = client_for(&config, CatalogRole::Source)?;
            let target = client_for(&config, CatalogRole::Target)?;
            let report = app.run(&source, &target);
            print_report(&report, output_mode).into_diagnostic()
        }
    }
}

fn replay_options(dry_run: bool) -> ReplayOptions {
    ReplayOptions { dry_run }
}

fn client_for(config: &ResolvedConfig, role: CatalogRole) -> Result<CkanHttpClient, MigrateError> {
    let endpoint = config.endpoint(role)?;
    tracing::debug!(catalog = role.as_str(), url = %endpoint.base_url, "connecting");
    CkanHttpClient::new(endpoint)
}
