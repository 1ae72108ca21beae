//! CmLoad CLI
//!
//! Runs the four import operations against a `MemoryStore` snapshot file:
//! - `load`: full import into an empty store
//! - `import-object`: one object into an owner's field
//! - `import-fields`: several fields of one owner, merging known objects
//! - `update-list`: reconcile a list with a canonical document
//! - `show`: summarise a snapshot or print one object

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cmload_engine::identity::{parse_object_id, ParsedId};
use cmload_engine::{LoadConfig, LoadReport, Loader, Phase, ProgressSink, XmlSource};
use cmload_schema::{FieldId, MetadataService, ObjectId, SchemaCatalog};
use cmload_store::{MemoryStore, ObjectStore};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmload")]
#[command(author, version, about = "Load CmObject XML into an object store")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Store snapshot (created on first write)
    #[arg(short, long, global = true, default_value = "store.cmdb")]
    store: PathBuf,

    /// Schema file in the .cms dialect (defaults to the built-in core schema)
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the log to this file instead of stderr
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a whole database into an empty store
    Load {
        input: PathBuf,
        /// Also write the report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Import one object into a field of an existing owner
    ImportObject {
        input: PathBuf,
        /// Owner id (number or GUID)
        #[arg(long)]
        owner: String,
        /// Owning field (`Class.Field` or numeric id)
        #[arg(long)]
        field: String,
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Import several fields of one owner, merging pre-existing objects
    ImportFields {
        input: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Update a list from its canonical XML
    UpdateList {
        input: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Summarise the store, or print one object
    Show {
        /// Object id or GUID
        #[arg(long)]
        object: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global)?;

    let catalog = load_schema(cli.global.schema.as_deref())?;
    let config = match &cli.global.config {
        Some(path) => LoadConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => LoadConfig::default(),
    };
    let mut store = MemoryStore::open(&cli.global.store)
        .with_context(|| format!("opening store {}", cli.global.store.display()))?;

    match cli.command {
        Commands::Load { input, report } => {
            let result = {
                let mut loader = loader(&mut store, &catalog, config);
                loader.load_full_database(&XmlSource::file(&input))
            };
            finish(&store, &cli.global.store, result, report.as_deref())?;
        }
        Commands::ImportObject {
            input,
            owner,
            field,
            report,
        } => {
            let owner = resolve_object(&store, &owner)?;
            let field = resolve_field(&catalog, &field)?;
            let result = {
                let mut loader = loader(&mut store, &catalog, config);
                loader.import_object_into_field(&XmlSource::file(&input), owner, field)
            };
            finish(&store, &cli.global.store, result, report.as_deref())?;
        }
        Commands::ImportFields {
            input,
            owner,
            report,
        } => {
            let owner = resolve_object(&store, &owner)?;
            let result = {
                let mut loader = loader(&mut store, &catalog, config);
                loader.import_multiple_fields_into_owner(&XmlSource::file(&input), owner)
            };
            finish(&store, &cli.global.store, result, report.as_deref())?;
        }
        Commands::UpdateList {
            input,
            owner,
            field,
            report,
        } => {
            let owner = resolve_object(&store, &owner)?;
            let field = resolve_field(&catalog, &field)?;
            let result = {
                let mut loader = loader(&mut store, &catalog, config);
                loader.update_list_from_xml(&XmlSource::file(&input), owner, field)
            };
            finish(&store, &cli.global.store, result, report.as_deref())?;
        }
        Commands::Show { object } => match object {
            Some(raw) => show_object(&store, &catalog, resolve_object(&store, &raw)?)?,
            None => show_summary(&store, &catalog),
        },
    }
    Ok(())
}

fn init_logging(args: &GlobalArgs) -> Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match &args.log {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_schema(path: Option<&Path>) -> Result<SchemaCatalog> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading schema {}", path.display()))?;
            SchemaCatalog::from_dsl(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => cmload_schema::core_catalog().context("parsing the built-in core schema"),
    }
}

fn loader<'a>(
    store: &'a mut MemoryStore,
    catalog: &'a SchemaCatalog,
    config: LoadConfig,
) -> Loader<'a> {
    Loader::new(store, catalog)
        .with_config(config)
        .with_progress(PhaseTicker::default())
}

/// Numeric id or GUID in any of the XML id spellings.
fn resolve_object(store: &MemoryStore, raw: &str) -> Result<ObjectId> {
    if let Ok(n) = raw.trim().trim_start_matches('#').parse::<u32>() {
        let id = ObjectId::new(n);
        if !store.contains(id) {
            bail!("no object {id} in the store");
        }
        return Ok(id);
    }
    match parse_object_id(raw) {
        ParsedId::Guid(guid) => store
            .lookup_guid(&guid)
            .ok_or_else(|| anyhow!("no object with GUID {guid}")),
        ParsedId::Name(name) => bail!("`{name}` is neither an object id nor a GUID"),
    }
}

/// `Class.Field` or a numeric field id.
fn resolve_field(catalog: &SchemaCatalog, raw: &str) -> Result<FieldId> {
    if let Ok(n) = raw.trim().parse::<u32>() {
        let id = FieldId::new(n);
        catalog
            .field(id)
            .ok_or_else(|| anyhow!("unknown field id {n}"))?;
        return Ok(id);
    }
    let (class, field) = raw
        .split_once('.')
        .ok_or_else(|| anyhow!("expected Class.Field, got `{raw}`"))?;
    let class_id = catalog
        .class_id_for_name(class)
        .ok_or_else(|| anyhow!("unknown class {class}"))?;
    catalog
        .field_by_name(class_id, field)
        .map(|f| f.id)
        .ok_or_else(|| anyhow!("{class} has no field {field}"))
}

fn finish(
    store: &MemoryStore,
    path: &Path,
    result: cmload_engine::LoadResult<LoadReport>,
    report_path: Option<&Path>,
) -> Result<()> {
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{} {err}", "failed:".red().bold());
            bail!("import aborted; the store file was not written");
        }
    };
    store
        .save(path)
        .with_context(|| format!("writing store {}", path.display()))?;
    if let Some(out) = report_path {
        fs::write(out, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing report {}", out.display()))?;
    }

    print!("{report}");
    let soft: usize = report.diagnostics.values().sum();
    let status = if soft == 0 {
        "ok".green().bold()
    } else {
        "ok (with warnings)".yellow().bold()
    };
    eprintln!("{status} {}", path.display().to_string().bold());
    Ok(())
}

fn show_summary(store: &MemoryStore, catalog: &SchemaCatalog) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for id in store.object_ids() {
        if let Some(row) = store.object(id) {
            *counts.entry(catalog.class_name(row.class)).or_default() += 1;
        }
    }
    println!(
        "{} objects, highest id {}",
        store.object_count().to_string().bold(),
        store.max_object_id()
    );
    for (class, count) in counts {
        println!("  {class:<28} {count:>8}");
    }
}

fn show_object(store: &MemoryStore, catalog: &SchemaCatalog, id: ObjectId) -> Result<()> {
    let row = store
        .object(id)
        .ok_or_else(|| anyhow!("no object {id}"))?;
    println!(
        "{} {} {}",
        id.to_string().bold(),
        catalog.class_name(row.class).cyan(),
        row.guid
    );
    if let Some(owner) = row.owner {
        let ord = owner.ord.map(|o| format!(" @{o}")).unwrap_or_default();
        println!(
            "  owner {} . {}{ord}",
            owner.owner,
            catalog.field_name(owner.field)
        );
    }
    for desc in catalog.fields_of_class(row.class) {
        let name = &desc.name;
        if let Some(value) = store.scalar(id, desc.id) {
            println!("  {name:<24} {value:?}");
        }
        for (ws, text) in store.multilingual_all(id, desc.id) {
            println!("  {name:<24} [{ws}] {}", text.text);
        }
        let refs = store.references(id, desc.id);
        if !refs.is_empty() {
            let targets: Vec<String> = refs.iter().map(|r| r.target.to_string()).collect();
            println!("  {name:<24} -> {}", targets.join(", "));
        }
        let owned = store.owned_objects(id, desc.id);
        if !owned.is_empty() && desc.kind.is_owning() {
            let children: Vec<String> = owned.iter().map(|c| c.to_string()).collect();
            println!("  {name:<24} owns {}", children.join(", "));
        }
    }
    Ok(())
}

/// Prints one line per phase change.
#[derive(Default)]
struct PhaseTicker {
    last: Option<Phase>,
}

impl ProgressSink for PhaseTicker {
    fn tick(&mut self, phase: Phase, percent: u8) {
        if self.last != Some(phase) {
            eprintln!("{} {phase}", "phase".blue().bold());
            self.last = Some(phase);
        } else if percent == 100 {
            tracing::debug!(%phase, "phase step complete");
        }
    }
}
