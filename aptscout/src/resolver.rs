//! Dynamic import resolution
//!
//! Every `GetProcAddress` call site of the program is resolved to a `(dll, api)` pair
//! where possible. A call site whose DLL or API name comes in through a parameter of the
//! enclosing function is resolved again at every call of that function, with the
//! actual arguments substituted.

use crate::api_dict::{ApiDict, normalize_dll_name};
use crate::apidb::{Disambiguator, LazyApiDatabase};
use crate::cache::{DecompilationCache, Decompiled};
use crate::config::ResolverOptions;
use crate::convention::normalize_calling_conventions;
use crate::expression::Expression;
use crate::handle::{CallStack, HandleResolver, handle_offset};
use crate::name::{LiteralSources, literal_paired_with, resolve_api_name};
use crate::program::{FunctionMetadata, ProgramContext};
use crate::references::{
    GET_PROC_ADDRESS, callers_of, functions_referencing, loader_functions, references_to_import,
};
use crate::syntax::{CallSite, compact, contains_identifier};
use log::debug;
use std::rc::Rc;

/// Handle parameter of the enclosing function, read at a field offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleParam {
    /// Parameter position
    pub index: usize,
    /// Whitespace-free offset text, e.g. `+0x1c`
    pub offset: String,
}

/// Parameters of the enclosing function a call site depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalParams {
    /// Parameter holding the DLL name passed to the library-loading call
    pub lib_file_name: Option<usize>,
    /// Parameter holding the API name
    pub proc_name: Option<usize>,
    /// Parameter holding the module handle
    pub module: Option<ModuleParam>,
}

impl ExternalParams {
    /// Returns true if nothing depends on a parameter
    pub fn is_empty(&self) -> bool {
        self.lib_file_name.is_none() && self.proc_name.is_none() && self.module.is_none()
    }
}

/// Partial resolution of one `GetProcAddress` call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteResolution {
    /// DLL and API name are both literals
    BothFound {
        /// DLL name as written in the code
        dll: String,
        /// API name
        api: String,
    },
    /// Something is missing but nothing depends on a parameter
    NeitherExternal {
        /// DLL name, if found
        dll: Option<String>,
        /// API name, if found
        api: Option<String>,
    },
    /// Missing values come from parameters of the enclosing function
    ExternalParams {
        /// DLL name, if found locally
        dll: Option<String>,
        /// API name, if found locally
        api: Option<String>,
        /// Where the missing values come from
        params: ExternalParams,
    },
}

/// Resolves the dynamic imports of one program
///
/// # Example
/// ```
/// use aptscout::{DynamicImportResolver, FunctionRecord, LazyApiDatabase, MemoryProgram, ResolverOptions};
///
/// let program = MemoryProgram::new("sample.exe")
///     .with_external(0x1000, "KERNEL32.DLL", "LoadLibraryA")
///     .with_external(0x1004, "KERNEL32.DLL", "GetProcAddress")
///     .with_function(FunctionRecord::new(0x401000, "FUN_00401000").size(0x40).code(
///         "void FUN_00401000(void)\n{\n  HMODULE hModule;\n  \n  \
///          hModule = LoadLibraryA(\"shell32.dll\");\n  \
///          GetProcAddress(hModule,\"IsUserAnAdmin\");\n  return;\n}\n",
///     ))
///     .with_call(0x401008, 0x1000)
///     .with_call(0x401010, 0x1004);
///
/// let mut resolver = DynamicImportResolver::new(&program, &ResolverOptions::default(), LazyApiDatabase::disabled());
/// let dynamic = resolver.resolve();
/// assert!(dynamic.contains("shell32.dll", "IsUserAnAdmin"));
/// ```
pub struct DynamicImportResolver<'p> {
    program: &'p dyn ProgramContext,
    handles: HandleResolver<'p>,
    disambiguator: Disambiguator<'p>,
}

impl<'p> DynamicImportResolver<'p> {
    /// Prepares the resolution: locates the library-loading functions and, on 32-bit
    /// programs, fixes their calling conventions.
    pub fn new(
        program: &'p dyn ProgramContext,
        options: &ResolverOptions,
        database: LazyApiDatabase,
    ) -> Self {
        let mut cache = DecompilationCache::new();
        let loaders = loader_functions(program);
        if options.normalize_conventions {
            normalize_calling_conventions(program, &mut cache, &loaders);
        }
        let loaders: Vec<FunctionMetadata> = loaders.iter().map(|f| cache.latest(f)).collect();

        DynamicImportResolver {
            program,
            handles: HandleResolver::new(program, cache, &loaders, options.max_depth),
            disambiguator: Disambiguator::new(program, database),
        }
    }

    /// Resolves every `GetProcAddress` call site of the program.
    pub fn resolve(&mut self) -> ApiDict {
        let mut dynamic = ApiDict::new();

        let refs = references_to_import(self.program, GET_PROC_ADDRESS);
        for function in functions_referencing(self.program, &refs) {
            let code = self.handles.decompile(&function);
            let calls: Vec<CallSite> = code.calls_to(GET_PROC_ADDRESS).cloned().collect();

            for call in &calls {
                match self.resolve_call_site(&code, call) {
                    CallSiteResolution::BothFound { dll, api } => {
                        self.record(&mut dynamic, Some(&dll), &api);
                    }
                    CallSiteResolution::NeitherExternal { api: Some(api), .. } => {
                        self.record(&mut dynamic, None, &api);
                    }
                    CallSiteResolution::NeitherExternal { api: None, .. } => {}
                    CallSiteResolution::ExternalParams { dll, api, params } => {
                        self.propagate(code.function(), dll, api, &params, &mut dynamic);
                    }
                }
            }
        }

        dynamic
    }

    /// Resolves one `GetProcAddress(hModule, lpProcName)` call inside `code`.
    pub fn resolve_call_site(&mut self, code: &Rc<Decompiled>, call: &CallSite) -> CallSiteResolution {
        let (Some(h), Some(proc_arg)) = (call.args.first(), call.args.get(1)) else {
            return CallSiteResolution::NeitherExternal {
                dll: None,
                api: None,
            };
        };
        let function = code.function().clone();
        let slice = code.before(call.start);

        let mut stack = CallStack::new(function.entry, self.handles.max_depth());
        let lib_file_name = self.handles.resolve(&slice, h, "", &mut stack);
        let dll = match &lib_file_name {
            Some(Expression::Literal(value)) => Some(value.clone()),
            Some(Expression::Reference(_)) => None,
            None => literal_paired_with(
                &slice,
                h,
                LiteralSources::CopyHelpersAndInternal,
                &[function.name.as_str()],
            ),
        };

        let proc_name = resolve_api_name(&slice, proc_arg);
        let api = proc_name.literal().map(String::from);

        if let (Some(dll), Some(api)) = (&dll, &api) {
            return CallSiteResolution::BothFound {
                dll: dll.clone(),
                api: api.clone(),
            };
        }

        let mut params = ExternalParams::default();
        for (index, param) in code.parameters() {
            if dll.is_none() {
                match &lib_file_name {
                    Some(Expression::Reference(name)) if name == param => {
                        params.lib_file_name = Some(index);
                        continue;
                    }
                    None if contains_identifier(h, param) => {
                        params.module = Some(ModuleParam {
                            index,
                            offset: handle_offset(h, param),
                        });
                        continue;
                    }
                    _ => {}
                }
            }
            if api.is_none() && proc_name.reference() == Some(param) {
                params.proc_name = Some(index);
            }
        }

        if params.is_empty() {
            CallSiteResolution::NeitherExternal { dll, api }
        } else {
            CallSiteResolution::ExternalParams { dll, api, params }
        }
    }

    /// Resolves a call site depending on parameters of `function` at every call of it.
    fn propagate(
        &mut self,
        function: &FunctionMetadata,
        dll: Option<String>,
        api: Option<String>,
        params: &ExternalParams,
        dynamic: &mut ApiDict,
    ) {
        for caller in callers_of(self.program, function) {
            let caller_code = self.handles.decompile(&caller);
            let calls: Vec<CallSite> = caller_code.calls_to(&function.name).cloned().collect();

            for call in &calls {
                let slice = caller_code.before(call.start);
                let excluded = [function.name.as_str(), caller.name.as_str()];
                let mut call_dll = dll.clone();
                let mut call_api = api.clone();

                if let Some(arg) = params.proc_name.and_then(|i| call.args.get(i))
                    && let Expression::Literal(value) = Expression::classify(arg)
                {
                    call_api = Some(value);
                }

                if let Some(arg) = params.lib_file_name.and_then(|i| call.args.get(i)) {
                    let value = match Expression::classify(arg) {
                        Expression::Literal(value) => Some(value),
                        Expression::Reference(name) => {
                            let assigned = slice
                                .assignments()
                                .rev()
                                .find(|a| compact(&a.lhs) == name)
                                .map(|a| Expression::classify(&a.rhs));
                            match assigned {
                                Some(expr) => expr.literal().map(String::from),
                                None => literal_paired_with(
                                    &slice,
                                    &name,
                                    LiteralSources::CopyHelpersAndInternal,
                                    &excluded,
                                ),
                            }
                        }
                    };
                    if value.is_some() {
                        call_dll = value;
                    }
                }

                if let Some(module) = &params.module
                    && let Some(h) = call.args.get(module.index)
                {
                    let mut stack = CallStack::new(function.entry, self.handles.max_depth())
                        .with_root(caller.entry);
                    if let Some(Expression::Literal(value)) =
                        self.handles.resolve(&slice, h, &module.offset, &mut stack)
                    {
                        call_dll = Some(value);
                    }
                }

                if let Some(api) = &call_api {
                    self.record(dynamic, call_dll.as_deref(), api);
                }
            }
        }
    }

    /// Adds `api` to `dynamic`, looking the DLL up in the API database when unknown.
    fn record(&self, dynamic: &mut ApiDict, dll: Option<&str>, api: &str) {
        let dll = dll
            .map(String::from)
            .or_else(|| self.disambiguator.resolve(api));

        match dll {
            Some(dll) => {
                let dll = normalize_dll_name(&dll);
                debug!("Found dynamic import: {}!{}", dll, api);
                dynamic.insert(&dll, api);
            }
            None => debug!("DLL not found for API: {}", api),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FunctionRecord, MemoryProgram};

    fn resolver_for(program: &MemoryProgram) -> DynamicImportResolver<'_> {
        DynamicImportResolver::new(program, &ResolverOptions::default(), LazyApiDatabase::disabled())
    }

    fn call_site_of(program: &MemoryProgram, function: &str) -> CallSiteResolution {
        let mut resolver = resolver_for(program);
        let function = program.function_named(function).unwrap();
        let code = resolver.handles.decompile(&function);
        let call = code.calls_to(GET_PROC_ADDRESS).next().unwrap().clone();
        resolver.resolve_call_site(&code, &call)
    }

    fn program_with(code: &str, params: &[&str]) -> MemoryProgram {
        MemoryProgram::new("p")
            .with_external(0x1000, "kernel32.dll", "LoadLibraryA")
            .with_external(0x1004, "kernel32.dll", "GetProcAddress")
            .with_function(
                FunctionRecord::new(0x401000, "FUN_00401000")
                    .size(0x100)
                    .params(params)
                    .code(code),
            )
            .with_call(0x401010, 0x1004)
    }

    #[test]
    fn test_both_found() {
        let program = program_with(
            "void FUN_00401000(void)\n{\n  h = LoadLibraryA(\"Shell32\");\n  GetProcAddress(h,\"ShellAboutA\");\n}\n",
            &[],
        );
        assert_eq!(
            call_site_of(&program, "FUN_00401000"),
            CallSiteResolution::BothFound {
                dll: "Shell32".into(),
                api: "ShellAboutA".into()
            }
        );
    }

    #[test]
    fn test_neither_external() {
        let program = program_with(
            "void FUN_00401000(void)\n{\n  GetProcAddress(DAT_0040c010,\"GetDiskFreeSpaceExA\");\n}\n",
            &[],
        );
        assert_eq!(
            call_site_of(&program, "FUN_00401000"),
            CallSiteResolution::NeitherExternal {
                dll: None,
                api: Some("GetDiskFreeSpaceExA".into())
            }
        );
    }

    #[test]
    fn test_external_params() {
        let program = program_with(
            "void FUN_00401000(LPCSTR param_1,LPCSTR param_2)\n{\n  HMODULE hModule;\n  \n  \
             hModule = LoadLibraryA(param_1);\n  GetProcAddress(hModule,param_2);\n}\n",
            &["param_1", "param_2"],
        );
        assert_eq!(
            call_site_of(&program, "FUN_00401000"),
            CallSiteResolution::ExternalParams {
                dll: None,
                api: None,
                params: ExternalParams {
                    lib_file_name: Some(0),
                    proc_name: Some(1),
                    module: None,
                },
            }
        );
    }

    #[test]
    fn test_external_module_with_offset() {
        let program = program_with(
            "void __thiscall FUN_00401000(void *this,LPCSTR param_1)\n{\n  \
             GetProcAddress(*(HMODULE *)((int)this + 0x1c),param_1);\n}\n",
            &["this", "param_1"],
        );
        assert_eq!(
            call_site_of(&program, "FUN_00401000"),
            CallSiteResolution::ExternalParams {
                dll: None,
                api: None,
                params: ExternalParams {
                    lib_file_name: None,
                    proc_name: Some(1),
                    module: Some(ModuleParam {
                        index: 0,
                        offset: "+0x1c".into()
                    }),
                },
            }
        );
    }

    #[test]
    fn test_dll_from_co_located_literal() {
        let program = program_with(
            "void FUN_00401000(void)\n{\n  FUN_00402000(&local_8,\"user32.dll\");\n  \
             GetProcAddress(local_8,\"MessageBoxA\");\n}\n",
            &[],
        );
        assert_eq!(
            call_site_of(&program, "FUN_00401000"),
            CallSiteResolution::BothFound {
                dll: "user32.dll".into(),
                api: "MessageBoxA".into()
            }
        );
    }

    #[test]
    fn test_malformed_call_is_ignored() {
        let program = program_with("void FUN_00401000(void)\n{\n  GetProcAddress(h);\n}\n", &[]);
        let mut resolver = resolver_for(&program);
        assert!(resolver.resolve().is_empty());
    }
}
