//! Analysis of one program
//!
//! Combines the import table listing with dynamic import resolution into one log.

use crate::api_dict::ApiDict;
use crate::apidb::LazyApiDatabase;
use crate::config::{ImportsType, ResolverOptions};
use crate::import_table::ImportTable;
use crate::program::ProgramContext;
use crate::report::ApiLog;
use crate::resolver::DynamicImportResolver;
use log::info;
use std::path::PathBuf;
use std::time::Instant;

/// Builder for the analysis of one program.
///
/// # Example
/// ```
/// use aptscout::{AnalysisBuilder, ImportsType, MemoryProgram};
///
/// let program = MemoryProgram::new("empty.exe").with_external(0x1000, "KERNEL32.DLL", "ExitProcess");
/// let log = AnalysisBuilder::new(&program)
///     .imports(ImportsType::ImportTable)
///     .run();
/// assert!(log.dynamic.is_none());
/// assert!(log.it.unwrap().contains("kernel32.dll", "ExitProcess"));
/// ```
pub struct AnalysisBuilder<'p> {
    program: &'p dyn ProgramContext,
    imports: ImportsType,
    api_database: Option<PathBuf>,
    import_table: Option<ImportTable>,
    options: ResolverOptions,
}

impl<'p> AnalysisBuilder<'p> {
    /// Creates a builder reporting every kind of import of `program`.
    pub fn new(program: &'p dyn ProgramContext) -> Self {
        AnalysisBuilder {
            program,
            imports: ImportsType::All,
            api_database: None,
            import_table: None,
            options: ResolverOptions::default(),
        }
    }

    /// Selects the imports reported.
    pub fn imports(mut self, imports: ImportsType) -> Self {
        self.imports = imports;
        self
    }

    /// Uses the API database at `path` to find the DLL of APIs whose handle could not be traced.
    ///
    /// The file is only read if such an API is met.
    pub fn api_database<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.api_database = Some(path.into());
        self
    }

    /// Caps the functions descended into while tracing one module handle.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.options.max_depth = depth;
        self
    }

    /// Enables or disables the `__thiscall` fix-up of 32-bit programs.
    pub fn normalize_conventions(mut self, enabled: bool) -> Self {
        self.options.normalize_conventions = enabled;
        self
    }

    /// Reports `table` instead of the external symbols of the program.
    pub fn import_table(mut self, table: ImportTable) -> Self {
        self.import_table = Some(table);
        self
    }

    /// Runs the analysis.
    pub fn run(self) -> ApiLog {
        let start = Instant::now();
        info!("Analyzing {}", self.program.name());

        let it = self.imports.includes_import_table().then(|| {
            self.import_table
                .unwrap_or_else(|| ImportTable::from_program(self.program))
                .to_api_dict()
        });

        let dynamic = self.imports.includes_dynamic().then(|| {
            let database = match self.api_database {
                Some(path) => LazyApiDatabase::new(path),
                None => LazyApiDatabase::disabled(),
            };
            DynamicImportResolver::new(self.program, &self.options, database).resolve()
        });

        info!(
            "Finished {}: {} import table APIs, {} dynamic APIs in {:.2?}",
            self.program.name(),
            it.as_ref().map_or(0, ApiDict::api_count),
            dynamic.as_ref().map_or(0, ApiDict::api_count),
            start.elapsed()
        );

        ApiLog { it, dynamic }
    }
}

/// Reports the import table and dynamic imports of `program` with default settings.
pub fn analyze(program: &dyn ProgramContext) -> ApiLog {
    AnalysisBuilder::new(program).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FunctionRecord, MemoryProgram};

    fn program() -> MemoryProgram {
        MemoryProgram::new("analysis.exe")
            .with_external(0x1000, "KERNEL32.DLL", "LoadLibraryA")
            .with_external(0x1004, "KERNEL32.DLL", "GetProcAddress")
            .with_function(FunctionRecord::new(0x401000, "FUN_00401000").size(0x40).code(
                "void FUN_00401000(void)\n{\n  HMODULE hModule;\n  \n  \
                 hModule = LoadLibraryA(\"user32\");\n  \
                 GetProcAddress(hModule,\"MessageBoxA\");\n  return;\n}\n",
            ))
            .with_call(0x401008, 0x1000)
            .with_call(0x401010, 0x1004)
    }

    #[test]
    fn test_analyze_reports_both_kinds() {
        let log = analyze(&program());
        let it = log.it.unwrap();
        assert!(it.contains("kernel32.dll", "LoadLibraryA"));
        assert!(it.contains("kernel32.dll", "GetProcAddress"));
        assert!(log.dynamic.unwrap().contains("user32.dll", "MessageBoxA"));
    }

    #[test]
    fn test_dynamic_only() {
        let program = program();
        let log = AnalysisBuilder::new(&program)
            .imports(ImportsType::Dynamic)
            .max_depth(1)
            .normalize_conventions(false)
            .run();
        assert!(log.it.is_none());
        assert_eq!(log.dynamic.unwrap().len(), 1);
    }

    #[test]
    fn test_missing_api_database_is_not_fatal() {
        let program = program();
        let log = AnalysisBuilder::new(&program)
            .api_database("/nonexistent/apidb.json")
            .run();
        assert!(log.dynamic.unwrap().contains("user32.dll", "MessageBoxA"));
    }
}
