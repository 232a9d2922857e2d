//! Calling-convention fix-up for 32-bit code
//!
//! The decompiler sometimes misses the `__thiscall` convention on x86 methods, which
//! hides the object pointer the module handle is stored into. Functions calling a
//! library-loading API are reclassified when their body shows one of two tell-tale
//! shapes.

use crate::cache::DecompilationCache;
use crate::program::{CallingConvention, FunctionMetadata, ProgramContext};
use crate::syntax::{Scanner, Token, TokenKind, tokenize};
use log::debug;

/// Reclassifies `functions` as `__thiscall` where their pseudocode suggests it.
///
/// Runs on 32-bit programs only. Updated metadata is stored in `cache`; the number of
/// reclassified functions is returned.
pub fn normalize_calling_conventions(
    program: &dyn ProgramContext,
    cache: &mut DecompilationCache,
    functions: &[FunctionMetadata],
) -> usize {
    if program.address_size() != 32 {
        return 0;
    }

    let mut changed = 0;
    for function in functions {
        let function = cache.latest(function);
        if function.is_thiscall() {
            continue;
        }

        let Ok(text) = program.decompile(&function) else {
            continue;
        };

        if declares_this(&text) || has_uninitialized_handle_base(&text) {
            debug!("Changed calling convention of {}", function.name);
            cache.replace_metadata(function.with_calling_convention(CallingConvention::Thiscall));
            changed += 1;
        }
    }
    changed
}

/// `void *this;` or `int this;` declared as a local
pub fn declares_this(text: &str) -> bool {
    let tokens = tokenize(text);
    let texts: Vec<&str> = tokens.iter().map(|t| t.text(text)).collect();
    texts.windows(4).any(|w| matches!(w, ["void" | "int", "*", "this", ";"]))
        || texts.windows(3).any(|w| matches!(w, ["int", "this", ";"]))
}

/// A local `int`/`void *` that is dereferenced as `*(HMODULE *)(local + off)` without
/// ever being assigned in between, i.e. an implicit first argument.
pub fn has_uninitialized_handle_base(text: &str) -> bool {
    let tokens = tokenize(text);

    for (name, decl_end) in local_declarations(text, &tokens) {
        let Some(cast_start) = handle_cast_of(text, &tokens, decl_end, name) else {
            continue;
        };

        let assigned = Scanner::new(text, &tokens)
            .assignments()
            .iter()
            .any(|a| a.lhs == name && a.start >= decl_end && a.start < cast_start);
        return !assigned;
    }
    false
}

/// Returns `(name, byte offset after the declaration)` for `int X;` and `void *X;`
/// declarations of ordinary locals.
fn local_declarations<'a>(text: &'a str, tokens: &[Token]) -> Vec<(&'a str, usize)> {
    let at = |i: usize| tokens.get(i).map_or("", |t| t.text(text));
    let mut found = Vec::new();

    for index in 0..tokens.len() {
        let name_at = match at(index) {
            "int" => index + 1,
            "void" if at(index + 1) == "*" => index + 2,
            _ => continue,
        };
        let Some(name) = tokens.get(name_at).filter(|t| t.kind == TokenKind::Ident) else {
            continue;
        };
        let name = name.text(text);
        if at(name_at + 1) != ";"
            || name.len() < 2
            || name.starts_with('_')
            || name.starts_with("unaff")
            || name.starts_with("extraout")
        {
            continue;
        }
        found.push((name, tokens[name_at + 1].end));
    }
    found
}

/// Byte offset of the first `*(HMODULE *)` cast after `from` whose operand is `name`
/// plus something (an offset or a member access).
fn handle_cast_of(text: &str, tokens: &[Token], from: usize, name: &str) -> Option<usize> {
    let at = |i: usize| tokens.get(i).map_or("", |t| t.text(text));

    for index in 0..tokens.len() {
        if tokens[index].start < from {
            continue;
        }
        if !(at(index) == "*"
            && at(index + 1) == "("
            && at(index + 2) == "HMODULE"
            && at(index + 3) == "*"
            && at(index + 4) == ")")
        {
            continue;
        }

        let operand = index + 5;
        let matched = if at(operand) == "(" {
            let mut depth = 0usize;
            let mut close = None;
            for (i, token) in tokens.iter().enumerate().skip(operand) {
                match token.text(text) {
                    "(" => depth += 1,
                    ")" => {
                        depth -= 1;
                        if depth == 0 {
                            close = Some(i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            close.is_some_and(|close| {
                (operand + 1..close).any(|i| {
                    tokens[i].kind == TokenKind::Ident
                        && at(i) == name
                        && i + 1 < close
                        && !matches!(at(i + 1), "," | ")")
                })
            })
        } else {
            at(operand) == name
        };

        if matched {
            return Some(tokens[index].start);
        }
    }
    None
}
