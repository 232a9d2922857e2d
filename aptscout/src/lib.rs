//! Windows API fingerprinting of native executables
//!
//! This crate recovers the Windows APIs an executable uses, both the ones declared in its
//! import table and the ones it resolves at run time through `LoadLibrary*` /
//! `GetModuleHandle*` and `GetProcAddress`. Dynamic imports are recovered from the
//! decompiled pseudo-C of the program, tracing module handles and API names across
//! function boundaries.
//!
//! # Example
//!
//! ```
//! use aptscout::{analyze, FunctionRecord, MemoryProgram};
//!
//! let program = MemoryProgram::new("sample.exe")
//!     .with_external(0x1000, "KERNEL32.DLL", "LoadLibraryA")
//!     .with_external(0x1004, "KERNEL32.DLL", "GetProcAddress")
//!     .with_function(FunctionRecord::new(0x401000, "FUN_00401000").size(0x40).code(
//!         "void FUN_00401000(void)\n{\n  HMODULE hModule;\n  \n  \
//!          hModule = LoadLibraryA(\"shell32.dll\");\n  \
//!          GetProcAddress(hModule,\"IsUserAnAdmin\");\n  return;\n}\n",
//!     ))
//!     .with_call(0x401008, 0x1000)
//!     .with_call(0x401010, 0x1004);
//!
//! let log = analyze(&program);
//! assert!(log.it.unwrap().contains("kernel32.dll", "GetProcAddress"));
//! assert!(log.dynamic.unwrap().contains("shell32.dll", "IsUserAnAdmin"));
//! ```

mod analysis;
mod api_dict;
mod apidb;
pub mod cache;
mod config;
pub mod convention;
mod error;
mod expression;
pub mod handle;
mod import_table;
pub mod name;
mod program;
pub mod references;
mod report;
mod resolver;
pub mod syntax;

pub use analysis::{AnalysisBuilder, analyze};
pub use api_dict::{ApiDict, MODULE_EXTENSIONS, dll_base_name, normalize_dll_name};
pub use apidb::{ApiDatabase, DatabaseCheck, Disambiguator, LazyApiDatabase};
pub use config::{DEFAULT_MAX_DEPTH, ImportsType, ResolverOptions};
pub use error::{Error, Result};
pub use expression::Expression;
pub use import_table::{ImportEntry, ImportTable};
pub use program::{
    Address, CallingConvention, ExternalRecord, ExternalSymbol, FunctionMetadata, FunctionRecord,
    MemoryProgram, Parameter, ProgramContext, ProgramDump, Reference, ReferenceFlags,
    ReferenceRecord, Symbol, SymbolRecord,
};
pub use report::{ApiLog, file_sha1, sha1_hex, to_pretty_json};
pub use resolver::{CallSiteResolution, DynamicImportResolver, ExternalParams, ModuleParam};
