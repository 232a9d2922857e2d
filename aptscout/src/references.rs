//! Mapping cross-references back to the functions that make them

use crate::program::{FunctionMetadata, ProgramContext, Reference};
use std::collections::BTreeMap;

/// Imports that return a module handle
pub const LOADER_APIS: [&str; 6] = [
    "LoadLibraryA",
    "LoadLibraryW",
    "LoadLibraryExA",
    "LoadLibraryExW",
    "GetModuleHandleA",
    "GetModuleHandleW",
];

/// Import resolving an API address from a module handle
pub const GET_PROC_ADDRESS: &str = "GetProcAddress";

/// Returns true for `LoadLibrary`, `LoadLibraryEx` and `GetModuleHandle`, with or without
/// the `A`/`W` suffix.
pub fn is_loader_call(name: &str) -> bool {
    let base = name
        .strip_suffix('A')
        .or_else(|| name.strip_suffix('W'))
        .unwrap_or(name);
    matches!(base, "LoadLibrary" | "LoadLibraryEx" | "GetModuleHandle")
}

/// Returns the functions containing the call, jump or indirect references in `refs`.
///
/// A reference from an address outside every defined function is attributed to the
/// undefined function the program can recover there, if any. The result is
/// deduplicated and ordered by entry point.
pub fn functions_referencing(
    program: &dyn ProgramContext,
    refs: &[Reference],
) -> Vec<FunctionMetadata> {
    let mut functions = BTreeMap::new();

    for reference in refs.iter().filter(|r| r.flags.is_flow()) {
        let function = program
            .function_containing(reference.from)
            .or_else(|| program.undefined_function_at(reference.from));

        if let Some(function) = function {
            functions.entry(function.entry).or_insert(function);
        }
    }

    functions.into_values().collect()
}

/// Returns every function calling `function`, undefined functions included.
pub fn callers_of(program: &dyn ProgramContext, function: &FunctionMetadata) -> Vec<FunctionMetadata> {
    let Some(symbol) = program.symbols_named(&function.name).into_iter().next() else {
        return Vec::new();
    };
    functions_referencing(program, &program.references_to(symbol.address))
}

/// Returns the references to the external symbol `name`.
///
/// When the first reference is a data reference (an import thunk or a pointer slot),
/// the references to its origin are followed too.
pub fn references_to_import(program: &dyn ProgramContext, name: &str) -> Vec<Reference> {
    let Some(symbol) = program.external_symbol(name) else {
        return Vec::new();
    };

    let mut refs = program.references_to(symbol.address);
    if let Some(first) = refs.first().copied()
        && first.flags.is_data()
    {
        refs.extend(program.references_to(first.from));
    }
    refs
}

/// Returns the functions calling any of the library-loading imports.
pub fn loader_functions(program: &dyn ProgramContext) -> Vec<FunctionMetadata> {
    let refs: Vec<Reference> = LOADER_APIS
        .iter()
        .flat_map(|name| references_to_import(program, name))
        .collect();
    functions_referencing(program, &refs)
}
