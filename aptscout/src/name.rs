//! API-name and DLL-name recovery from co-located string literals
//!
//! When the name handed to `GetProcAddress` (or `LoadLibrary`) is a variable, it was
//! usually filled just before by a string copy helper or an internal function taking
//! both the buffer and the literal: `strcpy(local_28,"GetUserNameA");`.

use crate::cache::CodeSlice;
use crate::expression::Expression;
use crate::syntax::{compact, is_identifier, operand_names};

/// Which calls may pair a variable with a literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralSources {
    /// String and memory copy helpers only
    CopyHelpers,
    /// Copy helpers and internal functions
    CopyHelpersAndInternal,
}

/// Returns true for decompiler-generated names of internal functions
/// (`FUN_00401000`, `UndefinedFunction_00401000`).
pub fn is_internal_function_name(name: &str) -> bool {
    ["FUN_", "UndefinedFunction_"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
    })
}

/// Returns true for `strcpy`, `strncpy_s`, `wcscpy`, `memcpy`, `wmemmove_s`,
/// `basic_string<>` and the like.
pub fn is_copy_helper(name: &str) -> bool {
    if name == "basic_string<>" {
        return true;
    }
    let name = name.strip_suffix("_s").unwrap_or(name);
    matches!(
        name,
        "strcpy" | "strncpy" | "wcscpy" | "wcsncpy" | "memcpy" | "memmove" | "wmemcpy" | "wmemmove"
    )
}

fn mentions(arg: &str, var: &str) -> bool {
    if is_identifier(var) {
        operand_names(arg).contains(&var)
    } else {
        compact(arg).contains(&compact(var))
    }
}

/// Returns the literal passed next to `var` in one argument list.
///
/// The literal is the last non-`var` argument seen once `var` has been seen, so both
/// `strcpy(buf,"x")` and `FUN_00401000("x",buf)` pair `buf` with `x`.
pub fn co_located_literal(args: &[String], var: &str) -> Option<String> {
    let mut var_found = false;
    let mut candidate = None;

    for arg in args {
        if mentions(arg, var) {
            var_found = true;
        } else {
            candidate = Some(Expression::classify(arg));
        }

        if var_found && let Some(Expression::Literal(value)) = &candidate {
            return Some(value.clone());
        }
    }
    None
}

/// Searches the calls in `slice`, most recent first, for a literal copied into `var`.
///
/// Calls to any function named in `exclude` are skipped.
pub fn literal_paired_with(
    slice: &CodeSlice,
    var: &str,
    sources: LiteralSources,
    exclude: &[&str],
) -> Option<String> {
    slice
        .calls()
        .rev()
        .filter(|call| {
            is_copy_helper(&call.callee)
                || (sources == LiteralSources::CopyHelpersAndInternal
                    && is_internal_function_name(&call.callee))
        })
        .filter(|call| !exclude.contains(&call.callee.as_str()))
        .find_map(|call| co_located_literal(&call.args, var))
}

/// Resolves the API-name argument `arg` of a `GetProcAddress` call ending `slice`.
///
/// Returns the classified argument, with a reference replaced by the literal copied
/// into it when one is found.
pub fn resolve_api_name(slice: &CodeSlice, arg: &str) -> Expression {
    let name = match Expression::classify(arg) {
        Expression::Reference(name) => name,
        literal => return literal,
    };

    let current = slice.function().name.as_str();
    match literal_paired_with(slice, &name, LiteralSources::CopyHelpers, &[current]) {
        Some(value) => Expression::Literal(value),
        None => Expression::Reference(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DecompilationCache;
    use crate::program::{FunctionRecord, MemoryProgram, ProgramContext};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_name_predicates() {
        assert!(is_internal_function_name("FUN_00401a00"));
        assert!(is_internal_function_name("UndefinedFunction_00401000"));
        assert!(!is_internal_function_name("FUN_"));
        assert!(!is_internal_function_name("strcpy"));
        assert!(is_copy_helper("strncpy_s"));
        assert!(is_copy_helper("wmemcpy"));
        assert!(is_copy_helper("basic_string<>"));
        assert!(!is_copy_helper("strlen"));
    }

    #[test]
    fn test_co_located_literal() {
        assert_eq!(
            co_located_literal(&args(&["local_28", "\"MessageBoxA\""]), "local_28"),
            Some("MessageBoxA".into())
        );
        assert_eq!(
            co_located_literal(&args(&["\"user32.dll\"", "&local_10"]), "local_10"),
            Some("user32.dll".into())
        );
        assert_eq!(
            co_located_literal(&args(&["local_28", "local_30"]), "local_28"),
            None
        );
        assert_eq!(co_located_literal(&args(&["\"x\"", "y"]), "local_28"), None);
    }

    #[test]
    fn test_resolve_api_name_from_copy_helper() {
        let program = MemoryProgram::new("p").with_function(FunctionRecord::new(0x10, "FUN_00000010").code(
            "void FUN_00000010(void)\n{\n  char local_28 [32];\n  \n  \
             strcpy(local_28,\"StrToIntA\");\n  \
             FUN_00000400(local_28,\"decoy\");\n  \
             pFVar1 = GetProcAddress(hModule,local_28);\n}\n",
        ));
        let function = program.function_named("FUN_00000010").unwrap();
        let mut cache = DecompilationCache::new();
        let code = cache.get(&program, &function);
        let call = code.calls_to("GetProcAddress").next().unwrap().clone();
        let slice = code.before(call.start);

        assert_eq!(
            resolve_api_name(&slice, &call.args[1]),
            Expression::Literal("StrToIntA".into())
        );
        assert_eq!(
            literal_paired_with(&slice, "local_28", LiteralSources::CopyHelpersAndInternal, &[]),
            Some("decoy".into())
        );
        assert_eq!(
            resolve_api_name(&slice, "(LPCSTR)local_40"),
            Expression::Reference("local_40".into())
        );
    }
}
