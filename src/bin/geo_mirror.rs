use std::collections::BTreeSet;
use std::fs;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geo_mirror::app::{App, LogSink, SyncOptions};
use geo_mirror::archive::GeoHttpArchive;
use geo_mirror::clock::{Clock, NtpClock};
use geo_mirror::config::{ConfigLoader, MirrorConfig};
use geo_mirror::convert::CommandConverter;
use geo_mirror::domain::{EntityId, FileTag, Identity, MemberId};
use geo_mirror::error::MirrorError;
use geo_mirror::ledger::Ledger;
use geo_mirror::naming;
use geo_mirror::output::{
    BacklogResult, DiffResult, FilterResult, JsonOutput, LatestResult, OutputMode,
    print_run_summary,
};
use geo_mirror::refs::RefTable;
use geo_mirror::store::Store;
use geo_mirror::validity::{self, ValidityMap};

const CLOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "geo-mirror")]
#[command(about = "Incremental, versioned local mirror of GEO series and sample files")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Synchronize the backlog against the archive")]
    Sync(SyncArgs),
    #[command(about = "Show which series the next sync would visit")]
    Backlog(BacklogArgs),
    #[command(about = "Print the current durable file for an identity")]
    Latest(LatestArgs),
    #[command(about = "Series whose samples differ between two validity maps")]
    Diff(DiffArgs),
    #[command(about = "Build and store a new validity map from query listings")]
    Filter(FilterArgs),
    #[command(about = "Run an external converter on a series' metadata file")]
    Convert(ConvertArgs),
    #[command(about = "Manage stable references to mirrored files")]
    Ref(RefArgs),
}

#[derive(Args)]
struct SelectionArgs {
    #[arg(long, help = "Validity map; defaults to the newest stored one")]
    validity: Option<Utf8PathBuf>,

    #[arg(long, help = "Earlier validity map; series whose samples changed are revisited")]
    previous: Option<Utf8PathBuf>,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct SyncArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    #[arg(long = "entity")]
    entities: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct BacklogArgs {
    #[command(flatten)]
    selection: SelectionArgs,
}

#[derive(Args)]
struct LatestArgs {
    key: String,
    tag: String,
}

#[derive(Args)]
struct DiffArgs {
    old: Utf8PathBuf,
    new: Utf8PathBuf,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    series: Utf8PathBuf,

    #[arg(long)]
    samples: Utf8PathBuf,

    #[arg(long)]
    exclude: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ConvertArgs {
    entity: String,

    #[arg(long)]
    program: String,

    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Args)]
struct RefArgs {
    #[command(subcommand)]
    command: RefCommand,
}

#[derive(Subcommand)]
enum RefCommand {
    #[command(about = "Point an alias at an identity")]
    Bind { alias: String, key: String, tag: String },
    #[command(about = "Print the current file behind an alias")]
    Resolve { alias: String },
    #[command(about = "Remove an alias")]
    Unbind { alias: String },
    #[command(about = "List every alias and its identity")]
    List,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MirrorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::NotFound(_)
        | MirrorError::InvalidEntityId(_)
        | MirrorError::InvalidMemberId(_)
        | MirrorError::InvalidDurableName(_)
        | MirrorError::ValidityParse { .. }
        | MirrorError::ConfigRead(_)
        | MirrorError::ConfigParse(_)
        | MirrorError::AmbiguousLatest { .. } => 2,
        MirrorError::Connection { .. }
        | MirrorError::Listing { .. }
        | MirrorError::Stat { .. }
        | MirrorError::Fetch { .. }
        | MirrorError::ArchiveHttp(_)
        | MirrorError::ArchiveStatus { .. }
        | MirrorError::Clock(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(args) => run_sync(args, config, output_mode),
        Commands::Backlog(args) => run_backlog(args, config, output_mode),
        Commands::Latest(args) => run_latest(args, config, output_mode),
        Commands::Diff(args) => run_diff(args, output_mode),
        Commands::Filter(args) => run_filter(args, config, output_mode),
        Commands::Convert(args) => run_convert(args, config, output_mode),
        Commands::Ref(args) => run_ref(args, config),
    }
}

fn load_selection(
    selection: &SelectionArgs,
    store: &Store,
) -> Result<(ValidityMap, Option<ValidityMap>), MirrorError> {
    let current = match &selection.validity {
        Some(path) => ValidityMap::load(path)?,
        None => {
            let (path, map) = ValidityMap::load_latest(&store.equery_dir())?;
            tracing::info!(%path, "using newest validity map");
            map
        }
    };
    let previous = selection
        .previous
        .as_deref()
        .map(ValidityMap::load)
        .transpose()?;
    Ok((current, previous))
}

fn run_sync(args: SyncArgs, config: MirrorConfig, output_mode: OutputMode) -> miette::Result<()> {
    let only = if args.entities.is_empty() {
        None
    } else {
        Some(
            args.entities
                .iter()
                .map(|value| value.parse::<EntityId>())
                .collect::<Result<BTreeSet<_>, _>>()?,
        )
    };
    let archive = GeoHttpArchive::new(&config.archive_url, config.http_timeout)?;
    let clock = NtpClock::new(config.ntp_server.clone(), CLOCK_TIMEOUT);
    let app = App::open(config, archive, clock)?;
    let (current, previous) = load_selection(&args.selection, app.store())?;
    let options = SyncOptions {
        force: args.selection.force,
        only,
        workers: args.workers,
    };

    let report = match output_mode {
        OutputMode::Json => {
            let report = app.run(&current, previous.as_ref(), &options, &JsonOutput)?;
            JsonOutput::print_run(&report).into_diagnostic()?;
            report
        }
        OutputMode::Text => {
            let report = app.run(&current, previous.as_ref(), &options, &LogSink)?;
            print_run_summary(&report);
            report
        }
    };
    if let Some(error) = report.connection_error() {
        return Err(miette::Report::msg(format!("sync incomplete: {error}")));
    }
    Ok(())
}

fn run_backlog(
    args: BacklogArgs,
    config: MirrorConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let store = Store::new(config.root);
    let ledger = Ledger::open(&store.ledger_dir())?;
    let (current, previous) = load_selection(&args.selection, &store)?;
    let entities = validity::backlog(
        &current,
        previous.as_ref(),
        &ledger.entities_seen()?,
        args.selection.force,
    );
    let result = BacklogResult {
        force: args.selection.force,
        entities,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_backlog(&result).into_diagnostic()?,
        OutputMode::Text => {
            for entity in &result.entities {
                println!("{entity}");
            }
        }
    }
    Ok(())
}

fn parse_identity(key: &str, tag: &str) -> Result<Identity, MirrorError> {
    let tag = tag.parse::<FileTag>()?;
    let key = key.trim().to_ascii_uppercase();
    if tag == FileTag::Soft {
        key.parse::<EntityId>()?;
    } else {
        key.parse::<MemberId>()?;
    }
    Ok(Identity::new(key, tag))
}

fn run_latest(
    args: LatestArgs,
    config: MirrorConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let store = Store::new(config.root);
    let identity = parse_identity(&args.key, &args.tag)?;
    let path = naming::latest(&store.durable_dir_for(&identity), &identity)?
        .single(&identity)?
        .ok_or_else(|| MirrorError::NotFound(identity.to_string()))?;
    let result = LatestResult {
        identity: identity.to_string(),
        path: path.to_string(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_latest(&result).into_diagnostic()?,
        OutputMode::Text => println!("{}", result.path),
    }
    Ok(())
}

fn run_diff(args: DiffArgs, output_mode: OutputMode) -> miette::Result<()> {
    let old = ValidityMap::load(&args.old)?;
    let new = ValidityMap::load(&args.new)?;
    let result = DiffResult {
        changed: new.diff(&old).into_iter().collect(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_diff(&result).into_diagnostic()?,
        OutputMode::Text => {
            for entity in &result.changed {
                println!("{entity}");
            }
        }
    }
    Ok(())
}

fn read_text(path: &Utf8PathBuf) -> Result<String, MirrorError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| MirrorError::Filesystem(format!("read {path}: {err}")))
}

fn run_filter(
    args: FilterArgs,
    config: MirrorConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let store = Store::new(config.root.clone());
    store.ensure_layout()?;
    let series = validity::parse_listing(&read_text(&args.series)?);
    let samples = validity::parse_member_listing(&read_text(&args.samples)?);
    let mut filtered = series.filter_members(&samples);
    if let Some(exclude) = &args.exclude {
        filtered = filtered.exclude(&validity::parse_member_listing(&read_text(exclude)?));
    }

    let token = NtpClock::new(config.ntp_server.clone(), CLOCK_TIMEOUT).version_token()?;
    let path = filtered.store(&store.equery_dir(), token)?;
    let result = FilterResult {
        path: path.to_string(),
        entities: filtered.len(),
        members: filtered
            .entities()
            .filter_map(|entity| filtered.members(entity))
            .map(<[_]>::len)
            .sum(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_filter(&result).into_diagnostic()?,
        OutputMode::Text => println!(
            "{}: {} series, {} samples",
            result.path, result.entities, result.members
        ),
    }
    Ok(())
}

fn run_convert(
    args: ConvertArgs,
    config: MirrorConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let entity = args.entity.parse::<EntityId>()?;
    let archive = GeoHttpArchive::new(&config.archive_url, config.http_timeout)?;
    let clock = NtpClock::new(config.ntp_server.clone(), CLOCK_TIMEOUT);
    let app = App::open(config, archive, clock)?;
    let converter = CommandConverter::new(args.program, args.args);
    match output_mode {
        OutputMode::Json => {
            let result = app.convert_entity(&entity, &converter, &JsonOutput)?;
            JsonOutput::print_convert(&result).into_diagnostic()?;
        }
        OutputMode::Text => {
            let result = app.convert_entity(&entity, &converter, &LogSink)?;
            for output in &result.outputs {
                println!("{output}");
            }
        }
    }
    Ok(())
}

fn run_ref(args: RefArgs, config: MirrorConfig) -> miette::Result<()> {
    let store = Store::new(config.root);
    let path = store.refs_path();
    let mut table = RefTable::load(&path)?;
    match args.command {
        RefCommand::Bind { alias, key, tag } => {
            let identity = parse_identity(&key, &tag)?;
            if let Some(previous) = table.bind(alias.clone(), identity.clone()) {
                tracing::info!(%alias, %previous, "rebinding reference");
            }
            table.save(&path)?;
            println!("{alias} -> {identity}");
        }
        RefCommand::Resolve { alias } => {
            println!("{}", table.resolve(&alias, &store)?);
        }
        RefCommand::Unbind { alias } => {
            let previous = table
                .unbind(&alias)
                .ok_or_else(|| MirrorError::NotFound(format!("reference {alias}")))?;
            table.save(&path)?;
            println!("{alias} -x {previous}");
        }
        RefCommand::List => {
            for (alias, identity) in table.aliases() {
                println!("{alias} -> {identity}");
            }
        }
    }
    Ok(())
}
