//! Module-handle resolution
//!
//! Traces the handle passed to `GetProcAddress` back to the `LoadLibrary*` /
//! `GetModuleHandle*` call that produced it. The search looks for an assignment in the
//! code preceding the point of use first. When there is none, it descends into the
//! internal functions called earlier that received the handle, most recent first, and
//! repeats the search on the matching formal parameter.

use crate::cache::{CodeSlice, DecompilationCache, Decompiled};
use crate::expression::Expression;
use crate::program::{Address, FunctionMetadata, ProgramContext};
use crate::references::{callers_of, is_loader_call};
use crate::syntax::{
    Assignment, CallSite, TokenKind, compact, contains_identifier, is_identifier, operand_names,
    strip_casts, text_after_identifier,
};
use std::collections::BTreeSet;
use std::rc::Rc;

/// The expression a module handle is assigned to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleTarget {
    /// A handle expression as written at the point of use, e.g. `hModule`
    Expr(String),
    /// A formal parameter, or one of its local aliases, at a field offset.
    ///
    /// `offset` is whitespace-free, e.g. `+0x1c` for `*(HMODULE *)((int)this + 0x1c)`.
    Param {
        /// Parameter name followed by its aliases
        names: Vec<String>,
        /// Offset text following the name
        offset: String,
    },
}

impl HandleTarget {
    /// Builds the target for handle `h` read at `offset`.
    pub fn expression(h: &str, offset: &str) -> Self {
        let offset = compact(offset);
        let base = strip_casts(h);
        if !offset.is_empty() && is_identifier(base) {
            HandleTarget::Param {
                names: vec![base.to_string()],
                offset,
            }
        } else {
            HandleTarget::Expr(h.trim().to_string())
        }
    }

    /// Offset carried across calls
    pub fn offset(&self) -> &str {
        match self {
            HandleTarget::Expr(_) => "",
            HandleTarget::Param { offset, .. } => offset,
        }
    }

    /// Variables an actual argument must mention to pass this handle on
    pub fn names(&self) -> Vec<String> {
        match self {
            HandleTarget::Expr(h) => operand_names(h).into_iter().map(String::from).collect(),
            HandleTarget::Param { names, .. } => names.clone(),
        }
    }

    /// Returns true if assigning to `lhs` stores this handle.
    pub fn matches_lhs(&self, lhs: &str) -> bool {
        match self {
            HandleTarget::Expr(h) => {
                let declared = declared_name(lhs);
                let lhs = compact(lhs);
                [compact(h), compact(strip_casts(h))].iter().any(|target| {
                    ends_with_operand(&lhs, target) || declared == Some(target.as_str())
                })
            }
            HandleTarget::Param { names, offset } => {
                let tokens = crate::syntax::tokenize(lhs);
                tokens.iter().any(|t| {
                    t.kind == TokenKind::Ident
                        && names.iter().any(|n| n == t.text(lhs))
                        && compact(&lhs[t.end..]).starts_with(offset.as_str())
                })
            }
        }
    }
}

/// Variable declared by `lhs` when it is a declaration such as `HMODULE hModule`.
fn declared_name(lhs: &str) -> Option<&str> {
    let tokens = crate::syntax::tokenize(lhs);
    let declarator = tokens
        .iter()
        .all(|t| t.kind == TokenKind::Ident || t.text(lhs) == "*");
    let mut names = tokens.iter().filter(|t| t.kind == TokenKind::Ident);
    let last = names.next_back()?;
    (declarator && names.next().is_some()).then(|| last.text(lhs))
}

fn ends_with_operand(lhs: &str, target: &str) -> bool {
    if target.is_empty() || !lhs.ends_with(target) {
        return false;
    }
    let before = &lhs[..lhs.len() - target.len()];
    let joins_identifier = before
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && target
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    !joins_identifier
}

/// Field offset at which handle `h` reads parameter `param`, whitespace removed.
///
/// `*(HMODULE *)((int)this + 0x1c)` read through `this` gives `+0x1c`.
pub fn handle_offset(h: &str, param: &str) -> String {
    let after = text_after_identifier(h, param).unwrap_or("");
    let end = after.find([')', ',']).unwrap_or(after.len());
    compact(&after[..end])
}

/// Returns true if the actual argument `arg` mentions one of `names`.
pub fn argument_mentions(arg: &str, names: &[String]) -> bool {
    operand_names(arg)
        .iter()
        .any(|operand| names.iter().any(|n| n == operand))
}

enum Step {
    Loader(Option<String>),
    Alias(String, usize),
}

fn loader_argument(slice: &CodeSlice, assignment: &Assignment) -> Option<Option<String>> {
    let stripped = strip_casts(&assignment.rhs);
    let call_start = assignment.end - stripped.len();
    slice
        .calls()
        .find(|c| c.start == call_start && is_loader_call(&c.callee))
        .map(|c| c.args.first().cloned())
}

/// Searches `slice` for the closest assignment of a library-loading call to `target`.
///
/// A plain copy `target = other;` found on the way switches the search to `other`
/// in the code before the copy. Returns the classified first argument of the call.
pub fn find_loader_assignment(slice: &CodeSlice, target: &HandleTarget) -> Option<Expression> {
    let mut slice = slice.clone();
    let mut target = target.clone();

    loop {
        let step = slice.assignments().rev().find_map(|a| {
            if !target.matches_lhs(&a.lhs) {
                return None;
            }
            if let Some(arg) = loader_argument(&slice, a) {
                return Some(Step::Loader(arg));
            }
            let rhs = compact(strip_casts(&a.rhs));
            is_identifier(&rhs).then_some(Step::Alias(rhs, a.start))
        })?;

        match step {
            Step::Loader(arg) => return arg.map(|arg| Expression::classify(&arg)),
            Step::Alias(name, start) => {
                target = HandleTarget::Expr(name);
                slice = slice.truncate(start);
            }
        }
    }
}

/// Functions entered while resolving one value
///
/// The root frames (the function under analysis and, for propagated values, its caller)
/// are never re-entered and do not count towards the depth.
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<Address>,
    roots: usize,
    max_depth: usize,
}

impl CallStack {
    /// Creates a stack rooted at `root`.
    pub fn new(root: Address, max_depth: usize) -> Self {
        CallStack {
            frames: vec![root],
            roots: 1,
            max_depth,
        }
    }

    /// Adds another root frame (builder pattern).
    pub fn with_root(mut self, root: Address) -> Self {
        if !self.frames.contains(&root) {
            self.frames.insert(self.roots, root);
            self.roots += 1;
        }
        self
    }

    /// Number of functions descended into
    pub fn depth(&self) -> usize {
        self.frames.len() - self.roots
    }

    /// Returns true if `entry` is on the stack
    pub fn contains(&self, entry: Address) -> bool {
        self.frames.contains(&entry)
    }

    /// Enters `entry`, unless that would revisit a frame or exceed the depth cap.
    pub fn descend(&mut self, entry: Address) -> bool {
        if self.contains(entry) || self.depth() >= self.max_depth {
            return false;
        }
        self.frames.push(entry);
        true
    }

    /// Leaves the most recently entered function.
    pub fn ascend(&mut self) {
        if self.frames.len() > self.roots {
            self.frames.pop();
        }
    }
}

/// Resolves module handles to DLL names, descending into called functions
pub struct HandleResolver<'p> {
    program: &'p dyn ProgramContext,
    cache: DecompilationCache,
    sources: BTreeSet<Address>,
    max_depth: usize,
}

impl<'p> HandleResolver<'p> {
    /// Creates a resolver.
    ///
    /// Only `loader_functions` and their direct callers are descended into, since no
    /// other function can store a freshly loaded handle.
    pub fn new(
        program: &'p dyn ProgramContext,
        cache: DecompilationCache,
        loader_functions: &[FunctionMetadata],
        max_depth: usize,
    ) -> Self {
        let mut sources = BTreeSet::new();
        for function in loader_functions {
            sources.insert(function.entry);
            sources.extend(callers_of(program, function).iter().map(|f| f.entry));
        }

        HandleResolver {
            program,
            cache,
            sources,
            max_depth,
        }
    }

    /// Program under analysis
    pub fn program(&self) -> &'p dyn ProgramContext {
        self.program
    }

    /// Depth cap for new call stacks
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Decompiles `function` through the cache.
    pub fn decompile(&mut self, function: &FunctionMetadata) -> Rc<Decompiled> {
        self.cache.get(self.program, function)
    }

    /// Returns true if `function` may store a loaded module handle
    pub fn is_handle_source(&self, function: &FunctionMetadata) -> bool {
        self.sources.contains(&function.entry)
    }

    /// Resolves handle `h`, read at `offset`, used right after `slice`.
    pub fn resolve(
        &mut self,
        slice: &CodeSlice,
        h: &str,
        offset: &str,
        stack: &mut CallStack,
    ) -> Option<Expression> {
        let target = HandleTarget::expression(h, offset);
        self.resolve_target(slice, &target, stack)
    }

    fn resolve_target(
        &mut self,
        slice: &CodeSlice,
        target: &HandleTarget,
        stack: &mut CallStack,
    ) -> Option<Expression> {
        if let Some(found) = find_loader_assignment(slice, target) {
            return Some(found);
        }

        let names = target.names();
        if names.is_empty() {
            return None;
        }

        let calls: Vec<CallSite> = slice.calls().rev().cloned().collect();
        for call in calls {
            let Some(callee) = self.program.function_named(&call.callee) else {
                continue;
            };
            if stack.contains(callee.entry) || !self.is_handle_source(&callee) {
                continue;
            }
            if !stack.descend(callee.entry) {
                continue;
            }

            let found = self.resolve_in_callee(&callee, &call.args, &names, target.offset(), stack);
            stack.ascend();

            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Looks inside `callee` for the assignment of the parameter that received the handle.
    ///
    /// A reference found there is translated back into the argument the caller passed.
    fn resolve_in_callee(
        &mut self,
        callee: &FunctionMetadata,
        args: &[String],
        names: &[String],
        offset: &str,
        stack: &mut CallStack,
    ) -> Option<Expression> {
        let code = self.decompile(callee);

        for (index, arg) in args.iter().enumerate() {
            if !argument_mentions(arg, names) {
                continue;
            }
            let param = code.parameter(index)?.to_string();

            let mut aliases = vec![param.clone()];
            if let Some(alias) = local_alias(&code, &param) {
                aliases.push(alias);
            }
            let target = HandleTarget::Param {
                names: aliases,
                offset: offset.to_string(),
            };

            match self.resolve_target(&CodeSlice::whole(&code), &target, stack)? {
                Expression::Literal(value) => return Some(Expression::Literal(value)),
                Expression::Reference(name) => {
                    let actual = code
                        .parameters()
                        .into_iter()
                        .find(|(_, p)| contains_identifier(&name, p))
                        .and_then(|(ordinal, _)| args.get(ordinal));
                    if let Some(actual) = actual {
                        return Some(Expression::classify(actual));
                    }
                }
            }
        }
        None
    }

    /// Consumes the resolver, returning its cache.
    pub fn into_cache(self) -> DecompilationCache {
        self.cache
    }
}

/// First local that copies parameter `param`, e.g. `local_10 = (int *)param_1;`
fn local_alias(code: &Decompiled, param: &str) -> Option<String> {
    code.assignments()
        .iter()
        .find(|a| is_identifier(&a.lhs) && compact(strip_casts(&a.rhs)) == param)
        .map(|a| a.lhs.clone())
}
