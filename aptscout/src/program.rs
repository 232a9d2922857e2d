//! Program model supplied by the disassembler/decompiler
//!
//! The analysis never talks to a decompiler directly. Everything it needs (functions,
//! symbols, cross-references, string literals and pseudocode) goes through the
//! [`ProgramContext`] trait, so a headless decompiler bridge, a JSON export or a test
//! fixture can all drive the same engine.

use crate::{Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Address in the program's address space
pub type Address = u64;

/// Calling convention of a function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallingConvention {
    /// Not known or not reported
    #[default]
    Unknown,
    /// `__cdecl`
    Cdecl,
    /// `__stdcall`
    Stdcall,
    /// `__fastcall`
    Fastcall,
    /// `__thiscall`, first argument passed implicitly in `ECX`
    Thiscall,
    /// Any other named convention
    Other(String),
}

impl CallingConvention {
    /// Returns the decompiler's name for the convention
    pub fn name(&self) -> &str {
        match self {
            CallingConvention::Unknown => "unknown",
            CallingConvention::Cdecl => "__cdecl",
            CallingConvention::Stdcall => "__stdcall",
            CallingConvention::Fastcall => "__fastcall",
            CallingConvention::Thiscall => "__thiscall",
            CallingConvention::Other(name) => name,
        }
    }
}

impl From<&str> for CallingConvention {
    fn from(name: &str) -> Self {
        match name {
            "" | "unknown" | "default" => CallingConvention::Unknown,
            "__cdecl" => CallingConvention::Cdecl,
            "__stdcall" => CallingConvention::Stdcall,
            "__fastcall" => CallingConvention::Fastcall,
            "__thiscall" => CallingConvention::Thiscall,
            other => CallingConvention::Other(other.to_string()),
        }
    }
}

impl From<String> for CallingConvention {
    fn from(name: String) -> Self {
        CallingConvention::from(name.as_str())
    }
}

impl From<CallingConvention> for String {
    fn from(cc: CallingConvention) -> Self {
        cc.name().to_string()
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A formal parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// Zero-based position
    pub ordinal: usize,
    /// Parameter name as shown in the pseudocode
    pub name: String,
}

/// Function identity and signature metadata
///
/// Values are never patched in place: a changed calling convention produces a new
/// record (see [`FunctionMetadata::with_calling_convention`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionMetadata {
    /// Entry point, used as identity
    pub entry: Address,
    /// Function name
    pub name: String,
    /// Prototype string, may be empty
    pub signature: String,
    /// Declared parameters in ordinal order. May be empty even when the body uses parameters.
    pub parameters: Vec<Parameter>,
    /// Calling convention
    pub calling_convention: CallingConvention,
}

impl FunctionMetadata {
    /// Creates metadata with no parameters and an unknown convention.
    pub fn new(entry: Address, name: &str) -> Self {
        FunctionMetadata {
            entry,
            name: name.to_string(),
            signature: String::new(),
            parameters: Vec::new(),
            calling_convention: CallingConvention::Unknown,
        }
    }

    /// Sets the parameter names (builder pattern).
    pub fn with_parameters<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.parameters = names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| Parameter {
                ordinal,
                name: name.as_ref().to_string(),
            })
            .collect();
        self
    }

    /// Returns a copy using `convention`.
    ///
    /// Switching to `__thiscall` inserts the implicit `this` parameter at ordinal 0,
    /// shifting the declared ones, unless it is already there.
    pub fn with_calling_convention(&self, convention: CallingConvention) -> Self {
        let mut updated = self.clone();
        if convention == CallingConvention::Thiscall
            && updated.parameters.first().map(|p| p.name.as_str()) != Some("this")
        {
            updated.parameters.insert(
                0,
                Parameter {
                    ordinal: 0,
                    name: "this".to_string(),
                },
            );
            for (ordinal, param) in updated.parameters.iter_mut().enumerate() {
                param.ordinal = ordinal;
            }
        }
        updated.calling_convention = convention;
        updated
    }

    /// Returns true if the function uses `__thiscall`
    #[inline]
    pub fn is_thiscall(&self) -> bool {
        self.calling_convention == CallingConvention::Thiscall
    }

    /// Returns the prototype, synthesising one from the parameters when none is known.
    pub fn prototype(&self) -> String {
        if !self.signature.trim().is_empty() {
            return self.signature.clone();
        }
        let params = if self.parameters.is_empty() {
            "void".to_string()
        } else {
            self.parameters
                .iter()
                .map(|p| format!("undefined4 {}", p.name))
                .collect::<Vec<_>>()
                .join(",")
        };
        format!("undefined {}({})", self.name, params)
    }
}

bitflags! {
    /// Kind of a cross-reference
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReferenceFlags: u8 {
        /// Call instruction
        const CALL = 1 << 0;
        /// Jump instruction
        const JUMP = 1 << 1;
        /// Indirect or computed flow
        const INDIRECT = 1 << 2;
        /// Data reference
        const DATA = 1 << 3;
        /// Data read
        const READ = 1 << 4;
        /// Data write
        const WRITE = 1 << 5;
    }
}

impl ReferenceFlags {
    /// Translates a decompiler reference-type name such as `UNCONDITIONAL_CALL`,
    /// `COMPUTED_JUMP`, `INDIRECTION` or `DATA`.
    pub fn from_type_name(name: &str) -> Self {
        let name = name.to_ascii_uppercase();
        let mut flags = ReferenceFlags::empty();
        if name.contains("CALL") {
            flags |= ReferenceFlags::CALL;
        }
        if name.contains("JUMP") {
            flags |= ReferenceFlags::JUMP;
        }
        if name.contains("COMPUTED") || name.contains("INDIRECT") {
            flags |= ReferenceFlags::INDIRECT;
        }
        if name.contains("DATA") {
            flags |= ReferenceFlags::DATA;
        }
        if name.contains("READ") {
            flags |= ReferenceFlags::READ | ReferenceFlags::DATA;
        }
        if name.contains("WRITE") {
            flags |= ReferenceFlags::WRITE | ReferenceFlags::DATA;
        }
        flags
    }

    /// Returns true for call, jump and indirect references
    #[inline]
    pub fn is_flow(&self) -> bool {
        self.intersects(ReferenceFlags::CALL | ReferenceFlags::JUMP | ReferenceFlags::INDIRECT)
    }

    /// Returns true for data references
    #[inline]
    pub fn is_data(&self) -> bool {
        self.contains(ReferenceFlags::DATA)
    }
}

/// A cross-reference between two addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Origin address (the referencing instruction)
    pub from: Address,
    /// Referenced address
    pub to: Address,
    /// Reference kind
    pub flags: ReferenceFlags,
}

/// A symbol table entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Symbol address
    pub address: Address,
}

/// An imported symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalSymbol {
    /// Symbol name
    pub name: String,
    /// Library the symbol is imported from
    pub library: String,
    /// Name as stored in the import table when it differs (MSVC-mangled names)
    pub original_name: Option<String>,
    /// Address of the external location
    pub address: Address,
}

/// The decompiler/program collaborator
///
/// One context describes one binary. Implementations are read-only from the
/// analysis' point of view; calling-convention fix-ups are tracked by the analysis
/// itself and passed back through [`ProgramContext::decompile`].
pub trait ProgramContext {
    /// Program name
    fn name(&self) -> &str;

    /// Size in bits of the default address space (32 or 64)
    fn address_size(&self) -> u32;

    /// Content hash of the analysed executable, when the collaborator knows it
    fn content_hash(&self) -> Option<String> {
        None
    }

    /// All defined functions
    fn functions(&self) -> Vec<FunctionMetadata>;

    /// First global function called `name`
    fn function_named(&self, name: &str) -> Option<FunctionMetadata>;

    /// Defined function whose body contains `address`
    fn function_containing(&self, address: Address) -> Option<FunctionMetadata>;

    /// Function the decompiler can recover around `address` even though none is defined there
    fn undefined_function_at(&self, _address: Address) -> Option<FunctionMetadata> {
        None
    }

    /// Decompiles `function` to pseudo-C, honouring its calling convention
    fn decompile(&self, function: &FunctionMetadata) -> Result<String>;

    /// Imported symbol called `name`
    fn external_symbol(&self, name: &str) -> Option<Symbol>;

    /// Every imported symbol
    fn external_symbols(&self) -> Vec<ExternalSymbol>;

    /// Every symbol called `name`, functions included
    fn symbols_named(&self, name: &str) -> Vec<Symbol>;

    /// Every reference whose target is `address`
    fn references_to(&self, address: Address) -> Vec<Reference>;

    /// Values of all defined string literals
    fn defined_strings(&self) -> Vec<String>;
}

fn default_address_size() -> u32 {
    32
}

fn address<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Address, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAddress {
        Number(u64),
        Text(String),
    }

    match RawAddress::deserialize(deserializer)? {
        RawAddress::Number(value) => Ok(value),
        RawAddress::Text(text) => {
            let text = text.trim();
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => u64::from_str_radix(text, 16),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("bad address {text:?}: {e}")))
        }
    }
}

/// A function as exported in a program dump
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Entry point
    #[serde(deserialize_with = "address")]
    pub entry: Address,
    /// Body size in bytes
    #[serde(default)]
    pub size: u64,
    /// Function name
    pub name: String,
    /// Prototype string
    #[serde(default)]
    pub signature: String,
    /// Calling convention name
    #[serde(default)]
    pub calling_convention: CallingConvention,
    /// Declared parameter names
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Pseudocode; `None` when the decompiler failed
    #[serde(default)]
    pub decompiled: Option<String>,
    /// Pseudocode produced once the function is treated as `__thiscall`
    #[serde(default)]
    pub decompiled_thiscall: Option<String>,
    /// Not a defined function; only reachable through the undefined-function fallback
    #[serde(default)]
    pub undefined: bool,
}

impl FunctionRecord {
    /// Creates a record with a one-byte body and no pseudocode.
    pub fn new(entry: Address, name: &str) -> Self {
        FunctionRecord {
            entry,
            size: 1,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Sets the body size.
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the declared parameter names.
    pub fn params(mut self, names: &[&str]) -> Self {
        self.parameters = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Sets the prototype string.
    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }

    /// Sets the calling convention.
    pub fn convention(mut self, convention: CallingConvention) -> Self {
        self.calling_convention = convention;
        self
    }

    /// Sets the pseudocode.
    pub fn code(mut self, code: &str) -> Self {
        self.decompiled = Some(code.to_string());
        self
    }

    /// Sets the pseudocode produced under `__thiscall`.
    pub fn thiscall_code(mut self, code: &str) -> Self {
        self.decompiled_thiscall = Some(code.to_string());
        self
    }

    /// Marks the record as an undefined function.
    pub fn undefined(mut self) -> Self {
        self.undefined = true;
        self
    }

    fn contains(&self, address: Address) -> bool {
        address >= self.entry && address < self.entry + self.size.max(1)
    }

    fn metadata(&self) -> FunctionMetadata {
        FunctionMetadata {
            entry: self.entry,
            name: self.name.clone(),
            signature: self.signature.clone(),
            parameters: self
                .parameters
                .iter()
                .enumerate()
                .map(|(ordinal, name)| Parameter {
                    ordinal,
                    name: name.clone(),
                })
                .collect(),
            calling_convention: self.calling_convention.clone(),
        }
    }
}

/// An imported symbol as exported in a program dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// External location
    #[serde(deserialize_with = "address")]
    pub address: Address,
    /// Symbol name
    pub name: String,
    /// Importing library
    pub library: String,
    /// Name stored in the import table, when different
    #[serde(default)]
    pub original_name: Option<String>,
}

/// A plain symbol as exported in a program dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Symbol address
    #[serde(deserialize_with = "address")]
    pub address: Address,
    /// Symbol name
    pub name: String,
}

/// A cross-reference as exported in a program dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Origin address
    #[serde(deserialize_with = "address")]
    pub from: Address,
    /// Target address
    #[serde(deserialize_with = "address")]
    pub to: Address,
    /// Reference type name, e.g. `UNCONDITIONAL_CALL`
    #[serde(rename = "type")]
    pub kind: String,
}

/// Serialised form of a program, as written by a decompiler export script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramDump {
    /// Program name
    pub name: String,
    /// Address size in bits
    #[serde(default = "default_address_size")]
    pub address_size: u32,
    /// Content hash of the executable
    #[serde(default)]
    pub hash: Option<String>,
    /// Functions, defined and undefined
    #[serde(default)]
    pub functions: Vec<FunctionRecord>,
    /// Imported symbols
    #[serde(default)]
    pub externals: Vec<ExternalRecord>,
    /// Other symbols (labels, data)
    #[serde(default)]
    pub symbols: Vec<SymbolRecord>,
    /// Cross-references
    #[serde(default)]
    pub references: Vec<ReferenceRecord>,
    /// Defined string literals
    #[serde(default)]
    pub strings: Vec<String>,
}

/// In-memory [`ProgramContext`] backed by a [`ProgramDump`]
///
/// # Example
/// ```
/// use aptscout::{FunctionRecord, MemoryProgram, ProgramContext};
///
/// let program = MemoryProgram::new("sample.exe")
///     .with_external(0x1000_0000, "kernel32.dll", "LoadLibraryA")
///     .with_function(FunctionRecord::new(0x401000, "FUN_00401000").size(0x40))
///     .with_call(0x401010, 0x1000_0000);
///
/// assert_eq!(program.function_containing(0x401010).unwrap().name, "FUN_00401000");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryProgram {
    dump: ProgramDump,
}

impl MemoryProgram {
    /// Creates an empty 32-bit program.
    pub fn new(name: &str) -> Self {
        MemoryProgram {
            dump: ProgramDump {
                name: name.to_string(),
                address_size: default_address_size(),
                ..Default::default()
            },
        }
    }

    /// Wraps a deserialised dump.
    pub fn from_dump(dump: ProgramDump) -> Result<Self> {
        if dump.address_size != 32 && dump.address_size != 64 {
            return Err(Error::ProgramDump(format!(
                "unsupported address size {}",
                dump.address_size
            )));
        }
        if let Some(record) = dump.functions.iter().find(|f| f.name.is_empty()) {
            return Err(Error::ProgramDump(format!(
                "function at 0x{:x} has no name",
                record.entry
            )));
        }
        Ok(MemoryProgram { dump })
    }

    /// Reads a JSON dump.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_dump(serde_json::from_reader(reader)?)
    }

    /// Loads a JSON dump from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Returns the underlying dump.
    pub fn dump(&self) -> &ProgramDump {
        &self.dump
    }

    /// Sets the address size (builder pattern).
    pub fn with_address_size(mut self, bits: u32) -> Self {
        self.dump.address_size = bits;
        self
    }

    /// Sets the content hash (builder pattern).
    pub fn with_hash(mut self, hash: &str) -> Self {
        self.dump.hash = Some(hash.to_string());
        self
    }

    /// Adds a function (builder pattern).
    pub fn with_function(mut self, function: FunctionRecord) -> Self {
        self.dump.functions.push(function);
        self
    }

    /// Adds an imported symbol (builder pattern).
    pub fn with_external(mut self, address: Address, library: &str, name: &str) -> Self {
        self.dump.externals.push(ExternalRecord {
            address,
            name: name.to_string(),
            library: library.to_string(),
            original_name: None,
        });
        self
    }

    /// Adds an imported symbol whose import-table name is mangled (builder pattern).
    pub fn with_mangled_external(
        mut self,
        address: Address,
        library: &str,
        name: &str,
        original_name: &str,
    ) -> Self {
        self.dump.externals.push(ExternalRecord {
            address,
            name: name.to_string(),
            library: library.to_string(),
            original_name: Some(original_name.to_string()),
        });
        self
    }

    /// Adds a plain symbol (builder pattern).
    pub fn with_symbol(mut self, address: Address, name: &str) -> Self {
        self.dump.symbols.push(SymbolRecord {
            address,
            name: name.to_string(),
        });
        self
    }

    /// Adds a reference of the named type (builder pattern).
    pub fn with_reference(mut self, from: Address, to: Address, kind: &str) -> Self {
        self.dump.references.push(ReferenceRecord {
            from,
            to,
            kind: kind.to_string(),
        });
        self
    }

    /// Adds an `UNCONDITIONAL_CALL` reference (builder pattern).
    pub fn with_call(self, from: Address, to: Address) -> Self {
        self.with_reference(from, to, "UNCONDITIONAL_CALL")
    }

    /// Adds a defined string (builder pattern).
    pub fn with_string(mut self, value: &str) -> Self {
        self.dump.strings.push(value.to_string());
        self
    }

    fn record(&self, entry: Address) -> Option<&FunctionRecord> {
        self.dump.functions.iter().find(|f| f.entry == entry)
    }
}

impl ProgramContext for MemoryProgram {
    fn name(&self) -> &str {
        &self.dump.name
    }

    fn address_size(&self) -> u32 {
        self.dump.address_size
    }

    fn content_hash(&self) -> Option<String> {
        self.dump.hash.clone()
    }

    fn functions(&self) -> Vec<FunctionMetadata> {
        self.dump
            .functions
            .iter()
            .filter(|f| !f.undefined)
            .map(FunctionRecord::metadata)
            .collect()
    }

    fn function_named(&self, name: &str) -> Option<FunctionMetadata> {
        self.dump
            .functions
            .iter()
            .find(|f| f.name == name)
            .map(FunctionRecord::metadata)
    }

    fn function_containing(&self, address: Address) -> Option<FunctionMetadata> {
        self.dump
            .functions
            .iter()
            .find(|f| !f.undefined && f.contains(address))
            .map(FunctionRecord::metadata)
    }

    fn undefined_function_at(&self, address: Address) -> Option<FunctionMetadata> {
        self.dump
            .functions
            .iter()
            .find(|f| f.undefined && f.contains(address))
            .map(FunctionRecord::metadata)
    }

    fn decompile(&self, function: &FunctionMetadata) -> Result<String> {
        let record = self.record(function.entry);
        let code = record.and_then(|r| {
            if function.is_thiscall() {
                r.decompiled_thiscall.clone().or_else(|| r.decompiled.clone())
            } else {
                r.decompiled.clone()
            }
        });
        code.ok_or_else(|| Error::Decompile {
            function: function.name.clone(),
            message: "no pseudocode available".to_string(),
        })
    }

    fn external_symbol(&self, name: &str) -> Option<Symbol> {
        self.dump
            .externals
            .iter()
            .find(|e| e.name == name)
            .map(|e| Symbol {
                name: e.name.clone(),
                address: e.address,
            })
    }

    fn external_symbols(&self) -> Vec<ExternalSymbol> {
        self.dump
            .externals
            .iter()
            .map(|e| ExternalSymbol {
                name: e.name.clone(),
                library: e.library.clone(),
                original_name: e.original_name.clone(),
                address: e.address,
            })
            .collect()
    }

    fn symbols_named(&self, name: &str) -> Vec<Symbol> {
        let functions = self
            .dump
            .functions
            .iter()
            .filter(|f| f.name == name)
            .map(|f| (f.name.as_str(), f.entry));
        let symbols = self
            .dump
            .symbols
            .iter()
            .filter(|s| s.name == name)
            .map(|s| (s.name.as_str(), s.address));
        let externals = self
            .dump
            .externals
            .iter()
            .filter(|e| e.name == name)
            .map(|e| (e.name.as_str(), e.address));

        functions
            .chain(symbols)
            .chain(externals)
            .map(|(name, address)| Symbol {
                name: name.to_string(),
                address,
            })
            .collect()
    }

    fn references_to(&self, address: Address) -> Vec<Reference> {
        self.dump
            .references
            .iter()
            .filter(|r| r.to == address)
            .map(|r| Reference {
                from: r.from,
                to: r.to,
                flags: ReferenceFlags::from_type_name(&r.kind),
            })
            .collect()
    }

    fn defined_strings(&self) -> Vec<String> {
        self.dump.strings.clone()
    }
}
