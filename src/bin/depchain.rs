use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use dependency_chain::common::{decanonicalize, path_to_string, readable_canonical_path};
use dependency_chain::managed::{ClrMetadataReader, ManagedReader, ManagedReferences};
use dependency_chain::pe::{BinaryCache, BinaryLoader, LoadedBinary};
use dependency_chain::report::{
    print_report, ApisetsReport, AssemblyRefsReport, ChainReport, ExportsReport, ImportsReport,
    KnownDllsReport, ManifestReport, ModuleRefsReport, ModulesReport, SxsReport,
};
use dependency_chain::sxs;
use dependency_chain::system::{KnownDLLList, WindowsSystem};
use dependency_chain::{
    DependencyGraph, LoaderServices, LookupError, LookupPath, LookupQuery, RootBinary,
};
use fs_err as fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "depchain",
    version,
    author,
    about = "Dump the imports, exports, manifest and whole dependency chain of Windows binaries"
)]
struct Cli {
    #[command(subcommand)]
    command: Action,

    /// Export results in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Read binaries in memory instead of mapping them, to prevent DLL file locking
    #[arg(long, global = true)]
    cache: bool,

    /// Limit recursion depth when analysing the dependency chain (default: unlimited)
    #[arg(short = 'd', long, global = true, value_name = "DEPTH")]
    depth: Option<usize>,

    /// Log the resolution steps
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Windows partition to use for system DLLs lookup (if not specified, the partition where
    /// FILE lies will be tested and used if valid)
    #[arg(short = 'w', long, global = true, value_name = "WINDOWS_ROOT")]
    windows_root: Option<PathBuf>,

    /// Working directory to be considered in the DLL lookup path (default: directory of FILE)
    #[arg(short = 'k', long, global = true, value_name = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// Additional DLL lookup path, ';' separated
    #[arg(short = 'a', long, global = true, value_name = "PATH")]
    userpath: Option<String>,

    /// File listing the known DLLs of the Windows installation, one per line
    #[arg(long, global = true, value_name = "FILE")]
    known_dlls: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Dump FILE imports
    Imports { file: PathBuf },
    /// Dump FILE exports
    Exports { file: PathBuf },
    /// Show the manifest embedded in FILE
    Manifest { file: PathBuf },
    /// Dump all of FILE's side-by-side dependencies
    #[command(name = "sxsentries")]
    SxsEntries { file: PathBuf },
    /// Dump the native modules referenced by the managed FILE
    #[command(name = "modulerefs")]
    ModuleRefs { file: PathBuf },
    /// Dump the assemblies referenced by the managed FILE
    #[command(name = "assemblyrefs")]
    AssemblyRefs { file: PathBuf },
    /// Dump FILE whole dependency chain
    Chain { file: PathBuf },
    /// Dump FILE resolved modules
    Modules { file: PathBuf },
    /// List all known DLLs (x86 and x64)
    #[command(name = "knowndll")]
    KnownDll,
    /// List the API set redirections of the system
    Apisets,
    /// List the API set redirections of the schema in FILE (apisetschema.dll)
    #[command(name = "apisetsdll")]
    ApisetsDll { file: PathBuf },
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "dependency_chain=debug"
    } else {
        "dependency_chain=warn"
    };
    let filter = EnvFilter::try_from_env("DEPCHAIN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Breadcrumb of the modules a failure happened in, from the failing module to the root
fn print_failure_trail(e: &LookupError) {
    if e.module_trail().is_empty() {
        return;
    }
    eprintln!("[x] {}", e.root_cause());
    for module in e.module_trail() {
        eprintln!("    in {}", decanonicalize(module));
    }
}

fn check_input(file: &Path) -> anyhow::Result<PathBuf> {
    if !file.exists() {
        bail!(
            "Could not find file {} on disk\nCurrent working directory: {}",
            path_to_string(file),
            path_to_string(std::env::current_dir()?)
        );
    }
    if file.is_dir() {
        bail!(
            "The specified path is a directory, not a PE file: {}",
            path_to_string(file)
        );
    }
    Ok(fs::canonicalize(file)?)
}

fn load_input(loader: &BinaryCache, file: &Path) -> anyhow::Result<std::rc::Rc<LoadedBinary>> {
    let path = check_input(file)?;
    debug!(path = %path.display(), "loading file");
    let binary = loader
        .load(&path)
        .with_context(|| format!("Could not load file {} as a PE", path_to_string(&path)))?;
    if !binary.recognized {
        bail!("Could not load file {} as a PE", path_to_string(&path));
    }
    Ok(binary)
}

fn read_managed(path: &Path) -> anyhow::Result<ManagedReferences> {
    match ClrMetadataReader.read_managed(path) {
        Ok(references) => Ok(references),
        Err(LookupError::NotManagedImage(_)) => Ok(ManagedReferences::default()),
        Err(e) => Err(e).with_context(|| {
            format!("Could not read the managed metadata of {}", path_to_string(path))
        }),
    }
}

fn user_path(paths: &str) -> anyhow::Result<Vec<PathBuf>> {
    paths
        .split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let p = Path::new(s);
            if p.exists() {
                Some(fs::canonicalize(p).map_err(anyhow::Error::from))
            } else {
                warn!(entry = s, "skipping non-existing path entry");
                None
            }
        })
        .collect()
}

#[cfg(windows)]
fn running_system() -> anyhow::Result<WindowsSystem> {
    Ok(WindowsSystem::current()?)
}

#[cfg(not(windows))]
fn running_system() -> anyhow::Result<WindowsSystem> {
    bail!("A Windows partition must be specified with --windows-root")
}

/// System to use when no input binary tells where the Windows installation is
fn host_system(cli: &Cli) -> anyhow::Result<WindowsSystem> {
    let system = match &cli.windows_root {
        Some(root) => WindowsSystem::from_root(root)
            .ok_or_else(|| anyhow!("No Windows installation found at {}", path_to_string(root)))?,
        None => running_system()?,
    };
    apply_known_dlls(cli, Some(system))?.ok_or_else(|| anyhow!("No Windows system available"))
}

fn apply_known_dlls(
    cli: &Cli,
    system: Option<WindowsSystem>,
) -> anyhow::Result<Option<WindowsSystem>> {
    match (system, &cli.known_dlls) {
        (Some(mut system), Some(list)) => {
            let known_dlls = KnownDLLList::from_list_file(list, &system.sys_dir)
                .with_context(|| format!("Could not read the known DLLs from {}", path_to_string(list)))?;
            system.known_dlls = Some(known_dlls);
            Ok(Some(system))
        }
        (None, Some(_)) => {
            warn!("no Windows system available, ignoring the list of known DLLs");
            Ok(None)
        }
        (system, None) => Ok(system),
    }
}

fn build_query(cli: &Cli, path: &Path) -> anyhow::Result<LookupQuery> {
    let mut query = LookupQuery::deduce_from_executable_location(path)?;

    query.parameters.max_depth = cli.depth;
    query.parameters.use_binary_cache = cli.cache;

    // overrides (must be last)

    if let Some(root) = &cli.windows_root {
        query.system = WindowsSystem::from_root(root);
        if query.system.is_none() {
            warn!(root = %root.display(), "no Windows installation found at the given root");
        }
    } else if let Some(system) = &query.system {
        debug!(sys_dir = %system.sys_dir.display(), "Windows partition root not specified, assumed");
    } else {
        warn!("Windows partition root not specified, and the binary doesn't lie in one; system DLL imports will not be resolved");
    }
    query.system = apply_known_dlls(cli, query.system.take())?;

    if let Some(workdir) = &cli.workdir {
        query.target.working_dir = workdir.clone();
    }
    if let Some(paths) = &cli.userpath {
        query.target.user_path.extend(user_path(paths)?);
    }
    Ok(query)
}

fn print_to_stdout<R>(report: &R, json: bool) -> anyhow::Result<()>
where
    R: dependency_chain::report::PrettyPrint + serde::Serialize,
{
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    print_report(report, json, &mut out)?;
    out.flush()?;
    Ok(())
}

fn dump_graph(cli: &Cli, loader: &BinaryCache, file: &Path, modules: bool) -> anyhow::Result<()> {
    let binary = load_input(loader, file)?;
    let query = build_query(cli, &binary.path)?;
    let max_recursion = query.parameters.max_recursion();
    let app_dir = query.target.app_dir.clone();
    let win_dir = query.system.as_ref().map(|s| s.win_dir.clone());
    let lookup_path = LookupPath::new(query);
    let search_path: Vec<String> = lookup_path
        .search_path()
        .iter()
        .map(|p| decanonicalize(&path_to_string(p)))
        .collect();
    debug!(path = %search_path.join(", "), "search path");

    let root = RootBinary::open(&binary, &app_dir, win_dir.as_deref())?;
    let managed = ClrMetadataReader;
    let services = LoaderServices {
        loader,
        managed: &managed,
        resolver: &lookup_path,
    };
    let graph = DependencyGraph::build(services, root, max_recursion).map_err(|e| {
        print_failure_trail(&e);
        e
    })?;

    if modules {
        print_to_stdout(&ModulesReport::new(&graph), cli.json)
    } else {
        print_to_stdout(&ChainReport::new(&graph), cli.json)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let loader = BinaryCache::new(cli.cache);

    match &cli.command {
        Action::Imports { file } => {
            let binary = load_input(&loader, file)?;
            print_to_stdout(&ImportsReport::new(&binary), cli.json)
        }
        Action::Exports { file } => {
            let binary = load_input(&loader, file)?;
            print_to_stdout(&ExportsReport::new(&binary), cli.json)
        }
        Action::Manifest { file } => {
            let binary = load_input(&loader, file)?;
            print_to_stdout(&ManifestReport::new(&binary), cli.json)
        }
        Action::SxsEntries { file } => {
            let binary = load_input(&loader, file)?;
            let query = build_query(&cli, &binary.path)?;
            let win_dir = query.system.as_ref().map(|s| s.win_dir.as_path());
            let entries = sxs::entries_for(&binary, &query.target.app_dir, win_dir)
                .with_context(|| {
                    format!(
                        "Could not read the side-by-side entries of {}",
                        readable_canonical_path(&binary.path).unwrap_or_else(|_| path_to_string(&binary.path))
                    )
                })?;
            print_to_stdout(&SxsReport::new(&binary.path, entries), cli.json)
        }
        Action::ModuleRefs { file } => {
            let path = check_input(file)?;
            let references = read_managed(&path)?;
            print_to_stdout(&ModuleRefsReport::new(&path, &references), cli.json)
        }
        Action::AssemblyRefs { file } => {
            let path = check_input(file)?;
            let references = read_managed(&path)?;
            print_to_stdout(&AssemblyRefsReport::new(&path, &references), cli.json)
        }
        Action::Chain { file } => dump_graph(&cli, &loader, file, false),
        Action::Modules { file } => dump_graph(&cli, &loader, file, true),
        Action::KnownDll => {
            let system = host_system(&cli)?;
            print_to_stdout(&KnownDllsReport::new(&system), cli.json)
        }
        Action::Apisets => {
            let system = host_system(&cli)?;
            let map = system
                .apiset_map
                .as_ref()
                .ok_or_else(|| anyhow!("No API set schema found in {}", path_to_string(&system.sys_dir)))?;
            print_to_stdout(&ApisetsReport::new(map), cli.json)
        }
        Action::ApisetsDll { file } => {
            let binary = load_input(&loader, file)?;
            let map = binary.apiset_schema.as_ref().ok_or_else(|| {
                anyhow!("{} has no API set schema", path_to_string(&binary.path))
            })?;
            print_to_stdout(&ApisetsReport::new(map), cli.json)
        }
    }
}
