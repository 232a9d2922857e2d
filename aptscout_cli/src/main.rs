//! aptscout command-line batch driver

use aptscout::{
    AnalysisBuilder, ApiDatabase, ApiLog, DEFAULT_MAX_DEPTH, DatabaseCheck, ImportTable,
    ImportsType, MemoryProgram, ProgramContext, file_sha1,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "aptscout")]
#[command(about = "Windows API fingerprinting from decompiled pseudocode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log every resolved import
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze program dumps exported from the disassembler
    Analyze {
        /// Program dump files (JSON)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Imports to report
        #[arg(short = 't', long = "type", value_enum, default_value = "all")]
        imports: Imports,

        /// API database used to find the DLL of APIs whose handle cannot be traced
        #[arg(long)]
        apidb: Option<PathBuf>,

        /// Directory receiving one <hash>.json log per program (default: stdout)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Executable the dump was exported from; its import table and hash are used
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Functions descended into while tracing a module handle
        #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
        max_depth: usize,

        /// Skip the __thiscall fix-up of 32-bit programs
        #[arg(long)]
        no_normalize: bool,
    },

    /// Check the dynamic imports of logs against an API database
    Verify {
        /// Directory of JSON logs
        log_dir: PathBuf,

        /// API database
        apidb: PathBuf,
    },

    /// Build the API database from an ApiScout export database
    #[command(alias = "builddb")]
    BuildDb {
        /// ApiScout database (JSON)
        input: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "apidb.json")]
        output: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Imports {
    /// Import table and dynamic imports
    All,
    /// Import table only
    #[value(name = "it")]
    ImportTable,
    /// Dynamic imports only
    Dynamic,
}

impl From<Imports> for ImportsType {
    fn from(imports: Imports) -> Self {
        match imports {
            Imports::All => ImportsType::All,
            Imports::ImportTable => ImportsType::ImportTable,
            Imports::Dynamic => ImportsType::Dynamic,
        }
    }
}

struct AnalyzeOptions {
    imports: ImportsType,
    apidb: Option<PathBuf>,
    log: Option<PathBuf>,
    binary: Option<PathBuf>,
    max_depth: usize,
    normalize: bool,
}

fn analyze_programs(inputs: Vec<PathBuf>, options: AnalyzeOptions) -> Result<(), String> {
    if options.binary.is_some() && inputs.len() > 1 {
        return Err("--binary can only be used with a single program dump".to_string());
    }

    let import_table = match (&options.binary, options.imports.includes_import_table()) {
        (Some(binary), true) => Some(
            ImportTable::load_pe(binary)
                .map_err(|e| format!("Failed to read {}: {}", binary.display(), e))?,
        ),
        _ => None,
    };

    let start = Instant::now();
    let mut failed = 0;
    for input in &inputs {
        if let Err(e) = analyze_program(input, &options, import_table.clone()) {
            eprintln!("Error: {}", e);
            failed += 1;
        }
    }

    eprintln!(
        "Analyzed {} of {} programs in {:.2?}",
        inputs.len() - failed,
        inputs.len(),
        start.elapsed()
    );

    if failed > 0 {
        return Err(format!("{} programs could not be analyzed", failed));
    }
    Ok(())
}

fn analyze_program(
    input: &Path,
    options: &AnalyzeOptions,
    import_table: Option<ImportTable>,
) -> Result<(), String> {
    let program = MemoryProgram::load(input)
        .map_err(|e| format!("Failed to load {}: {}", input.display(), e))?;

    let mut builder = AnalysisBuilder::new(&program)
        .imports(options.imports)
        .max_depth(options.max_depth)
        .normalize_conventions(options.normalize);
    if let Some(apidb) = &options.apidb {
        builder = builder.api_database(apidb);
    }
    if let Some(table) = import_table {
        builder = builder.import_table(table);
    }

    let log = builder.run();

    match &options.log {
        Some(dir) => {
            let hash = match program.content_hash() {
                Some(hash) => hash,
                None => {
                    let hashed = options.binary.as_deref().unwrap_or(input);
                    file_sha1(hashed)
                        .map_err(|e| format!("Failed to hash {}: {}", hashed.display(), e))?
                }
            };
            let path = log
                .write_to_dir(dir, &hash)
                .map_err(|e| format!("Failed to write log for {}: {}", input.display(), e))?;
            eprintln!("{} -> {}", input.display(), path.display());
        }
        None => println!("{}", log.to_json().map_err(|e| format!("{}", e))?),
    }

    Ok(())
}

fn verify_logs(log_dir: PathBuf, apidb: PathBuf) -> Result<(), String> {
    let database = ApiDatabase::load(&apidb)
        .map_err(|e| format!("Failed to load {}: {}", apidb.display(), e))?;

    let mut logs: Vec<PathBuf> = std::fs::read_dir(&log_dir)
        .map_err(|e| format!("Failed to read {}: {}", log_dir.display(), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    logs.sort();

    let mut checked = 0;
    let mut mismatches = 0;
    let mut unknown = 0;

    for path in &logs {
        let log = ApiLog::load(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let Some(dynamic) = log.dynamic else {
            continue;
        };
        let name = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();

        for (dll, apis) in dynamic.iter() {
            for api in apis {
                checked += 1;
                match database.check(dll, api) {
                    DatabaseCheck::Match => {}
                    DatabaseCheck::WrongDll(candidates) => {
                        mismatches += 1;
                        println!("{}: {}!{} is exported by {}", name, dll, api, candidates.join(", "));
                    }
                    DatabaseCheck::Unknown => {
                        unknown += 1;
                        println!("{}: {}!{} is not in the database", name, dll, api);
                    }
                }
            }
        }
    }

    println!(
        "{} logs, {} dynamic imports: {} wrong DLL, {} unknown",
        logs.len(),
        checked,
        mismatches,
        unknown
    );
    Ok(())
}

fn build_database(input: PathBuf, output: PathBuf) -> Result<(), String> {
    let file = std::fs::File::open(&input)
        .map_err(|e| format!("Failed to read {}: {}", input.display(), e))?;
    let database = ApiDatabase::from_apiscout(std::io::BufReader::new(file))
        .map_err(|e| format!("Failed to convert {}: {}", input.display(), e))?;

    let shared = database.shared_exports();
    for (api, dlls) in &shared {
        log::debug!("{} is exported by {}", api, dlls.join(", "));
    }

    database
        .save(&output)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;

    eprintln!(
        "Converted {} -> {} ({} APIs, {} exported by several DLLs)",
        input.display(),
        output.display(),
        database.len(),
        shared.len()
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("aptscout", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Commands::Analyze {
            inputs,
            imports,
            apidb,
            log,
            binary,
            max_depth,
            no_normalize,
        } => analyze_programs(
            inputs,
            AnalyzeOptions {
                imports: imports.into(),
                apidb,
                log,
                binary,
                max_depth,
                normalize: !no_normalize,
            },
        ),
        Commands::Verify { log_dir, apidb } => verify_logs(log_dir, apidb),
        Commands::BuildDb { input, output } => build_database(input, output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_analyze() {
        let cli = Cli::try_parse_from([
            "aptscout", "analyze", "a.json", "b.json", "-t", "it", "--max-depth", "5", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Analyze {
                inputs,
                imports,
                max_depth,
                no_normalize,
                ..
            } => {
                assert_eq!(inputs.len(), 2);
                assert!(imports == Imports::ImportTable);
                assert_eq!(max_depth, 5);
                assert!(!no_normalize);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_analyze_requires_input() {
        assert!(Cli::try_parse_from(["aptscout", "analyze"]).is_err());
        assert!(Cli::try_parse_from(["aptscout", "analyze", "a.json", "-t", "static"]).is_err());
    }

    #[test]
    fn test_imports_mapping() {
        assert_eq!(ImportsType::from(Imports::Dynamic), ImportsType::Dynamic);
        assert_eq!(ImportsType::from(Imports::All), ImportsType::All);
    }
}
