//! Per-analysis cache of decompiled functions
//!
//! Each function is decompiled at most once per analysis. Everything derived from the
//! pseudocode (tokens, call sites, assignments, parameters read from the signature) is
//! computed on first use and kept alongside the text.

use crate::program::{Address, FunctionMetadata, ProgramContext};
use crate::references::{GET_PROC_ADDRESS, is_loader_call};
use crate::syntax::{Assignment, CallSite, Scanner, Token, TokenKind, strip_casts, tokenize};
use log::debug;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A decompiled function and the facts derived from its text
#[derive(Debug)]
pub struct Decompiled {
    function: FunctionMetadata,
    text: String,
    tokens: OnceCell<Vec<Token>>,
    calls: OnceCell<Vec<CallSite>>,
    assignments: OnceCell<Vec<Assignment>>,
    signature_params: OnceCell<Vec<String>>,
}

impl Decompiled {
    /// Wraps already repaired pseudocode.
    pub fn new(function: FunctionMetadata, text: String) -> Self {
        Decompiled {
            function,
            text,
            tokens: OnceCell::new(),
            calls: OnceCell::new(),
            assignments: OnceCell::new(),
            signature_params: OnceCell::new(),
        }
    }

    /// Function metadata the text was produced for
    pub fn function(&self) -> &FunctionMetadata {
        &self.function
    }

    /// Pseudocode
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tokens of the pseudocode
    pub fn tokens(&self) -> &[Token] {
        self.tokens.get_or_init(|| tokenize(&self.text))
    }

    /// Every call site, the signature included
    pub fn call_sites(&self) -> &[CallSite] {
        self.calls
            .get_or_init(|| Scanner::new(&self.text, self.tokens()).calls())
    }

    /// Every assignment statement
    pub fn assignments(&self) -> &[Assignment] {
        self.assignments
            .get_or_init(|| Scanner::new(&self.text, self.tokens()).assignments())
    }

    /// Calls to `name`, excluding its definition
    pub fn calls_to<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CallSite> + 'a {
        self.call_sites()
            .iter()
            .filter(move |c| !c.definition && c.callee == name)
    }

    /// Parameter names parsed from the signature in the text.
    ///
    /// Used when the metadata reports fewer parameters than the body uses.
    pub fn signature_params(&self) -> &[String] {
        self.signature_params.get_or_init(|| {
            let signature = self
                .call_sites()
                .iter()
                .find(|c| c.definition && c.callee == self.function.name)
                .or_else(|| self.call_sites().iter().find(|c| c.callee == self.function.name));

            let Some(signature) = signature else {
                return Vec::new();
            };
            if signature.args.len() == 1 && signature.args[0] == "void" {
                return Vec::new();
            }
            signature.args.iter().map(|arg| declared_name(arg)).collect()
        })
    }

    /// Name of the formal parameter at `index`, metadata first.
    pub fn parameter(&self, index: usize) -> Option<&str> {
        match self.function.parameters.get(index) {
            Some(param) => Some(&param.name),
            None => self
                .signature_params()
                .get(index)
                .map(String::as_str)
                .filter(|name| !name.is_empty()),
        }
    }

    /// All formal parameters as `(ordinal, name)`, from metadata or from the text when
    /// the metadata has none.
    pub fn parameters(&self) -> Vec<(usize, &str)> {
        if self.function.parameters.is_empty() {
            self.signature_params()
                .iter()
                .enumerate()
                .map(|(index, name)| (index, name.as_str()))
                .collect()
        } else {
            self.function
                .parameters
                .iter()
                .map(|p| (p.ordinal, p.name.as_str()))
                .collect()
        }
    }

    /// Returns the pseudocode preceding byte offset `end`.
    pub fn before(self: &Rc<Self>, end: usize) -> CodeSlice {
        CodeSlice {
            code: Rc::clone(self),
            end: end.min(self.text.len()),
        }
    }
}

/// `int *param_1` -> `param_1`
fn declared_name(declaration: &str) -> String {
    declaration
        .rsplit(' ')
        .next()
        .unwrap_or(declaration)
        .replace('*', "")
        .trim()
        .to_string()
}

/// The part of a function's pseudocode before some point of use
#[derive(Debug, Clone)]
pub struct CodeSlice {
    code: Rc<Decompiled>,
    end: usize,
}

impl CodeSlice {
    /// The whole function
    pub fn whole(code: &Rc<Decompiled>) -> Self {
        code.before(code.text.len())
    }

    /// Function the slice belongs to
    pub fn function(&self) -> &FunctionMetadata {
        self.code.function()
    }

    /// Underlying decompiled function
    pub fn code(&self) -> &Rc<Decompiled> {
        &self.code
    }

    /// Byte offset where the slice ends
    pub fn end(&self) -> usize {
        self.end
    }

    /// Sliced text
    pub fn text(&self) -> &str {
        &self.code.text[..self.end]
    }

    /// Calls completed within the slice, excluding the signature, in source order
    pub fn calls(&self) -> impl DoubleEndedIterator<Item = &CallSite> {
        self.code
            .call_sites()
            .iter()
            .filter(|c| !c.definition && c.end <= self.end)
    }

    /// Assignments completed within the slice, in source order
    pub fn assignments(&self) -> impl DoubleEndedIterator<Item = &Assignment> {
        self.code
            .assignments()
            .iter()
            .filter(|a| a.end <= self.end)
    }

    /// Narrows the slice to end at `end`.
    pub fn truncate(&self, end: usize) -> CodeSlice {
        self.code.before(end.min(self.end))
    }
}

/// Decompiled text cache owned by one analysis run
///
/// The cache also holds the latest [`FunctionMetadata`] for functions whose calling
/// convention was changed during the analysis.
#[derive(Debug, Default)]
pub struct DecompilationCache {
    entries: HashMap<Address, Rc<Decompiled>>,
    metadata: HashMap<Address, FunctionMetadata>,
}

impl DecompilationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest metadata known for `function`.
    pub fn latest(&self, function: &FunctionMetadata) -> FunctionMetadata {
        self.metadata
            .get(&function.entry)
            .cloned()
            .unwrap_or_else(|| function.clone())
    }

    /// Records updated metadata, dropping any text decompiled under the old one.
    pub fn replace_metadata(&mut self, function: FunctionMetadata) {
        self.entries.remove(&function.entry);
        self.metadata.insert(function.entry, function);
    }

    /// Number of decompiled functions held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was decompiled yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the decompiled text of `function`, decompiling it on first use.
    ///
    /// A decompiler failure yields the prototype followed by an empty body.
    pub fn get(&mut self, program: &dyn ProgramContext, function: &FunctionMetadata) -> Rc<Decompiled> {
        if let Some(entry) = self.entries.get(&function.entry) {
            return Rc::clone(entry);
        }

        let function = self.latest(function);
        let text = match program.decompile(&function) {
            Ok(text) => repair_disguised_calls(&text),
            Err(e) => {
                debug!("{}; using its prototype", e);
                format!("{}{{}}", function.prototype())
            }
        };

        let entry = Rc::new(Decompiled::new(function, text));
        self.entries.insert(entry.function.entry, Rc::clone(&entry));
        entry
    }
}

/// Rewrites calls made through a pointer loaded from an `_exref` stub into direct calls.
///
/// ```text
/// pcVar1 = LoadLibraryA_exref;
/// hModule = (HMODULE)(*(code *)pcVar1)("user32.dll");
/// ```
/// becomes `hModule = LoadLibraryA("user32.dll");` on the second line.
pub fn repair_disguised_calls(text: &str) -> String {
    let tokens = tokenize(text);
    let scanner = Scanner::new(text, &tokens);

    let mut stubs: Vec<StubAssignment> = Vec::new();
    for assignment in scanner.assignments() {
        let target = strip_casts(&assignment.rhs);
        let Some(api) = target.strip_suffix("_exref") else {
            continue;
        };
        if (is_loader_call(api) || api == GET_PROC_ADDRESS)
            && crate::syntax::is_identifier(&assignment.lhs)
        {
            stubs.push(StubAssignment {
                var: assignment.lhs.clone(),
                api: api.to_string(),
                end: assignment.end,
            });
        }
    }
    if stubs.is_empty() {
        return text.to_string();
    }

    let mut replacements = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        match match_pointer_call(text, &tokens, index, &stubs) {
            Some((end, api)) => {
                replacements.push((tokens[index].start, tokens[end].end, api));
                index = end + 1;
            }
            None => index += 1,
        }
    }

    let mut repaired = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, api) in replacements {
        repaired.push_str(&text[last..start]);
        repaired.push_str(api);
        last = end;
    }
    repaired.push_str(&text[last..]);
    repaired
}

/// `var = Api_exref;` ending at byte `end`
struct StubAssignment {
    var: String,
    api: String,
    end: usize,
}

/// Matches `[(HMODULE)] [(*] (code *) [(*] stub )` at `index`, returning the index of
/// the closing token and the API last stored in the stub variable before the call.
fn match_pointer_call<'a>(
    text: &str,
    tokens: &[Token],
    index: usize,
    stubs: &'a [StubAssignment],
) -> Option<(usize, &'a str)> {
    let at = |i: usize| tokens.get(i).map_or("", |t| t.text(text));
    let seq = |i: usize, expected: &[&str]| expected.iter().enumerate().all(|(k, e)| at(i + k) == *e);

    let mut i = index;
    if seq(i, &["(", "HMODULE", ")"]) {
        i += 3;
    }
    if seq(i, &["(", "*"]) {
        i += 2;
    }
    if !seq(i, &["(", "code", "*", ")"]) {
        return None;
    }
    i += 4;
    if seq(i, &["(", "*"]) {
        i += 2;
    }

    let name = tokens.get(i).filter(|t| t.kind == TokenKind::Ident)?;
    let call_start = tokens[index].start;
    let stub = stubs
        .iter()
        .rev()
        .find(|s| s.var == name.text(text) && s.end <= call_start)?;
    (at(i + 1) == ")").then_some((i + 1, stub.api.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CallingConvention, FunctionRecord, MemoryProgram};

    #[test]
    fn test_repair_disguised_calls() {
        let src = "  pcVar1 = LoadLibraryA_exref;\n  \
                   hModule = (HMODULE)(*(code *)pcVar1)(\"user32.dll\");\n  \
                   pcVar2 = (code *)GetProcAddress_exref;\n  \
                   p = (*(code *)pcVar2)(hModule,\"MessageBoxA\");\n";
        let repaired = repair_disguised_calls(src);
        assert!(repaired.contains("hModule = LoadLibraryA(\"user32.dll\");"));
        assert!(repaired.contains("p = GetProcAddress(hModule,\"MessageBoxA\");"));
    }

    #[test]
    fn test_repair_reused_stub_variable() {
        let src = "  pcVar1 = LoadLibraryA_exref;\n  \
                   hModule = (HMODULE)(*(code *)pcVar1)(\"user32.dll\");\n  \
                   pcVar1 = GetProcAddress_exref;\n  \
                   p = (*(code *)pcVar1)(hModule,\"MessageBoxA\");\n";
        let repaired = repair_disguised_calls(src);
        assert!(repaired.contains("hModule = LoadLibraryA(\"user32.dll\");"));
        assert!(repaired.contains("p = GetProcAddress(hModule,\"MessageBoxA\");"));
    }

    #[test]
    fn test_repair_ignores_stub_assigned_after_call() {
        let src = "x = (*(code *)pcVar1)(0);\npcVar1 = LoadLibraryA_exref;\n";
        assert_eq!(repair_disguised_calls(src), src);
    }

    #[test]
    fn test_repair_leaves_other_pointers() {
        let src = "pcVar1 = VirtualAlloc_exref;\nx = (*(code *)pcVar1)(0);\n";
        assert_eq!(repair_disguised_calls(src), src);
    }

    #[test]
    fn test_get_falls_back_to_prototype() {
        let program = MemoryProgram::new("p").with_function(
            FunctionRecord::new(0x10, "FUN_00000010")
                .signature("void __stdcall FUN_00000010(char *param_1)"),
        );
        let function = program.function_named("FUN_00000010").unwrap();
        let mut cache = DecompilationCache::new();

        let code = cache.get(&program, &function);
        assert_eq!(code.text(), "void __stdcall FUN_00000010(char *param_1){}");
        assert_eq!(code.signature_params(), ["param_1"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_is_memoized() {
        let program = MemoryProgram::new("p")
            .with_function(FunctionRecord::new(0x10, "f").code("void f(void)\n{\n  g();\n}\n"));
        let function = program.function_named("f").unwrap();
        let mut cache = DecompilationCache::new();

        let first = cache.get(&program, &function);
        let second = cache.get(&program, &function);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.calls_to("g").count(), 1);
        assert!(first.signature_params().is_empty());
    }

    #[test]
    fn test_parameters_fall_back_to_signature() {
        let program = MemoryProgram::new("p").with_function(
            FunctionRecord::new(0x10, "FUN_00000010")
                .code("void FUN_00000010(HMODULE *param_1,LPCSTR param_2)\n{\n  return;\n}\n"),
        );
        let function = program.function_named("FUN_00000010").unwrap();
        let mut cache = DecompilationCache::new();
        let code = cache.get(&program, &function);

        assert_eq!(code.parameter(1), Some("param_2"));
        assert_eq!(code.parameter(2), None);
        assert_eq!(code.parameters(), vec![(0, "param_1"), (1, "param_2")]);
    }

    #[test]
    fn test_replace_metadata_redecompiles() {
        let program = MemoryProgram::new("p").with_function(
            FunctionRecord::new(0x10, "f")
                .params(&["param_1"])
                .code("plain")
                .thiscall_code("thiscall"),
        );
        let function = program.function_named("f").unwrap();
        let mut cache = DecompilationCache::new();
        assert_eq!(cache.get(&program, &function).text(), "plain");

        cache.replace_metadata(function.with_calling_convention(CallingConvention::Thiscall));
        let code = cache.get(&program, &function);
        assert_eq!(code.text(), "thiscall");
        assert_eq!(code.parameter(0), Some("this"));
        assert!(cache.latest(&function).is_thiscall());
    }

    #[test]
    fn test_code_slice_filters_by_end() {
        let program = MemoryProgram::new("p").with_function(FunctionRecord::new(0x10, "f").code(
            "void f(void)\n{\n  a = g(1);\n  b = h(2);\n}\n",
        ));
        let function = program.function_named("f").unwrap();
        let mut cache = DecompilationCache::new();
        let code = cache.get(&program, &function);

        let cut = code.text().find("b =").unwrap();
        let slice = code.before(cut);
        let callees: Vec<_> = slice.calls().map(|c| c.callee.as_str()).collect();
        assert_eq!(callees, vec!["g"]);
        assert_eq!(slice.assignments().count(), 1);
        assert_eq!(CodeSlice::whole(&code).calls().count(), 2);
    }
}
