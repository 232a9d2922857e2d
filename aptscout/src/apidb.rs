//! API name database and DLL disambiguation
//!
//! The database maps an exported API name to every DLL known to export it. It is only
//! consulted when the DLL of a dynamic import could not be recovered from the code: the
//! DLL is then picked among the candidates by looking for its name among the string
//! literals of the binary.

use crate::api_dict::{MODULE_EXTENSIONS, dll_base_name};
use crate::program::ProgramContext;
use crate::report::to_pretty_json;
use crate::{Error, Result};
use log::warn;
use serde::Deserialize;
use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Exported API name to candidate DLLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiDatabase {
    entries: HashMap<String, Vec<String>>,
}

/// Outcome of checking a `(dll, api)` pair against the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseCheck {
    /// The DLL is one of the API's candidates
    Match,
    /// The API is only exported by the listed DLLs
    WrongDll(Vec<String>),
    /// The API is not in the database
    Unknown,
}

#[derive(Deserialize)]
struct ApiScoutDb {
    dlls: BTreeMap<String, ApiScoutDll>,
}

#[derive(Deserialize)]
struct ApiScoutDll {
    #[serde(default)]
    exports: Vec<ApiScoutExport>,
}

#[derive(Deserialize)]
struct ApiScoutExport {
    #[serde(default)]
    name: Option<String>,
}

/// `32_10.0.17134_kernel32.dll_0x6b800000` -> `kernel32.dll`
fn apiscout_dll_name(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("32_").or_else(|| key.strip_prefix("64_"))?;
    let (version, rest) = rest.split_once('_')?;
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let end = rest
        .match_indices("_0x")
        .map(|(pos, _)| pos)
        .find(|&pos| rest[pos + 3..].starts_with(|c: char| c.is_ascii_digit()))?;
    Some(&rest[..end])
}

impl ApiDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a `{"api": ["dll", ...]}` JSON database.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let entries: HashMap<String, Vec<String>> = serde_json::from_reader(reader)
            .map_err(|e| Error::ApiDatabase(e.to_string()))?;
        Ok(ApiDatabase { entries })
    }

    /// Loads a database file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Builds the database from an ApiScout export database.
    pub fn from_apiscout<R: Read>(reader: R) -> Result<Self> {
        let source: ApiScoutDb =
            serde_json::from_reader(reader).map_err(|e| Error::ApiDatabase(e.to_string()))?;

        let mut database = ApiDatabase::new();
        for (key, dll) in &source.dlls {
            let dll_name = apiscout_dll_name(key)
                .ok_or_else(|| Error::ApiDatabase(format!("unrecognised DLL key {:?}", key)))?;
            for name in dll.exports.iter().filter_map(|e| e.name.as_deref()) {
                if !name.is_empty() {
                    database.insert(name, dll_name);
                }
            }
        }
        Ok(database)
    }

    /// Writes the database as sorted, indented JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let sorted: BTreeMap<&String, &Vec<String>> = self.entries.iter().collect();
        std::fs::write(path, to_pretty_json(&sorted)?)?;
        Ok(())
    }

    /// Records that `dll` exports `api`.
    pub fn insert(&mut self, api: &str, dll: &str) {
        let dlls = self.entries.entry(api.to_string()).or_default();
        if !dlls.iter().any(|d| d == dll) {
            dlls.push(dll.to_string());
        }
    }

    /// DLLs exporting `api`, in database order
    pub fn candidates(&self, api: &str) -> &[String] {
        self.entries.get(api).map(Vec::as_slice).unwrap_or(&[])
    }

    /// APIs exported by more than one DLL, sorted
    pub fn shared_exports(&self) -> Vec<(&str, &[String])> {
        let mut shared: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, dlls)| dlls.len() > 1)
            .map(|(api, dlls)| (api.as_str(), dlls.as_slice()))
            .collect();
        shared.sort();
        shared
    }

    /// Checks a resolved `(dll, api)` pair.
    pub fn check(&self, dll: &str, api: &str) -> DatabaseCheck {
        let candidates = self.candidates(api);
        if candidates.is_empty() {
            return DatabaseCheck::Unknown;
        }
        let dll = dll_base_name(dll);
        if candidates.iter().any(|c| dll_base_name(c) == dll) {
            DatabaseCheck::Match
        } else {
            DatabaseCheck::WrongDll(candidates.to_vec())
        }
    }

    /// Number of APIs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the database has no entry
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An API database loaded on first use
///
/// A missing or malformed file disables database-assisted resolution with a warning
/// instead of failing the analysis.
#[derive(Debug, Default)]
pub struct LazyApiDatabase {
    path: Option<PathBuf>,
    database: OnceCell<Option<ApiDatabase>>,
}

impl LazyApiDatabase {
    /// Loads `path` on first use.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        LazyApiDatabase {
            path: Some(path.into()),
            database: OnceCell::new(),
        }
    }

    /// No database.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// An already loaded database.
    pub fn loaded(database: ApiDatabase) -> Self {
        LazyApiDatabase {
            path: None,
            database: OnceCell::from(Some(database)),
        }
    }

    /// Returns the database, loading it on the first call.
    pub fn get(&self) -> Option<&ApiDatabase> {
        self.database
            .get_or_init(|| {
                let path = self.path.as_ref()?;
                match ApiDatabase::load(path) {
                    Ok(database) => Some(database),
                    Err(e) => {
                        warn!("API database {} unavailable: {}", path.display(), e);
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Picks the DLL of an API among its database candidates
pub struct Disambiguator<'p> {
    program: &'p dyn ProgramContext,
    database: LazyApiDatabase,
    strings: OnceCell<Vec<String>>,
}

impl<'p> Disambiguator<'p> {
    /// Creates a disambiguator over the strings of `program`.
    pub fn new(program: &'p dyn ProgramContext, database: LazyApiDatabase) -> Self {
        Disambiguator {
            program,
            database,
            strings: OnceCell::new(),
        }
    }

    fn strings(&self) -> &[String] {
        self.strings.get_or_init(|| {
            self.program
                .defined_strings()
                .iter()
                .map(|s| s.trim().to_lowercase())
                .collect()
        })
    }

    /// Returns the single candidate DLL of `api` named by a string literal of the binary.
    ///
    /// Candidates are compared case-insensitively, tolerating a missing `.dll` suffix on
    /// either side. An extension-less candidate also matches a literal with another module
    /// extension (`winspool` and `winspool.drv`), and the literal's name is returned then.
    /// No match or several matching candidates give `None`.
    pub fn resolve(&self, api: &str) -> Option<String> {
        let candidates = self.database.get()?.candidates(api);
        if candidates.is_empty() {
            return None;
        }

        let mut found: Vec<String> = Vec::new();
        for candidate in candidates {
            let candidate = candidate.trim().to_lowercase();
            let base = candidate.strip_suffix(".dll").unwrap_or(&candidate);
            let literal = self
                .strings()
                .iter()
                .find(|s| !s.is_empty() && literal_names_dll(s, base));
            if let Some(literal) = literal {
                let dll = if literal.len() > base.len() {
                    literal.clone()
                } else {
                    candidate.clone()
                };
                if !found.contains(&dll) {
                    found.push(dll);
                }
            }
        }

        match found.len() {
            1 => found.pop(),
            0 => None,
            _ => {
                warn!("Ambiguous DLL for API {}: {}", api, found.join(", "));
                None
            }
        }
    }
}

/// Returns true if the lower-cased `literal` names the DLL `base`, given without `.dll`.
fn literal_names_dll(literal: &str, base: &str) -> bool {
    if literal.strip_suffix(".dll").unwrap_or(literal) == base {
        return true;
    }
    !MODULE_EXTENSIONS.iter().any(|ext| base.ends_with(ext)) && dll_base_name(literal) == base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::MemoryProgram;

    fn database() -> ApiDatabase {
        ApiDatabase::from_reader(
            r#"{
                "GetUserNameA": ["advapi32"],
                "SHGetFolderPathA": ["shell32", "shfolder"],
                "OpenPrinterA": ["winspool"]
            }"#
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_candidates() {
        let db = database();
        assert_eq!(db.candidates("SHGetFolderPathA"), ["shell32", "shfolder"]);
        assert!(db.candidates("Nope").is_empty());
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_check() {
        let db = database();
        assert_eq!(db.check("advapi32.dll", "GetUserNameA"), DatabaseCheck::Match);
        assert_eq!(
            db.check("kernel32.dll", "GetUserNameA"),
            DatabaseCheck::WrongDll(vec!["advapi32".into()])
        );
        assert_eq!(db.check("kernel32.dll", "Whatever"), DatabaseCheck::Unknown);
    }

    #[test]
    fn test_from_apiscout() {
        let source = r#"{"dlls": {
            "32_10.0.17134_kernel32.dll_0x6b800000": {"exports": [{"name": "GetTickCount"}, {"name": ""}, {"name": null}]},
            "32_10.0.17134_kernelbase.dll_0x10000000": {"exports": [{"name": "GetTickCount"}]},
            "64_10.0_user32.dll_0x180000000": {"exports": [{"name": "MessageBoxA"}]}
        }}"#;
        let db = ApiDatabase::from_apiscout(source.as_bytes()).unwrap();
        assert_eq!(db.candidates("GetTickCount"), ["kernel32.dll", "kernelbase.dll"]);
        assert_eq!(db.candidates("MessageBoxA"), ["user32.dll"]);
        assert_eq!(db.shared_exports(), vec![("GetTickCount", &db.candidates("GetTickCount")[..])]);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_from_apiscout_rejects_bad_key() {
        let source = r#"{"dlls": {"kernel32.dll": {"exports": []}}}"#;
        assert!(matches!(
            ApiDatabase::from_apiscout(source.as_bytes()),
            Err(Error::ApiDatabase(_))
        ));
    }

    #[test]
    fn test_apiscout_dll_name() {
        assert_eq!(apiscout_dll_name("32_10.0.17134_ws2_32.dll_0x71ab0000"), Some("ws2_32.dll"));
        assert_eq!(apiscout_dll_name("16_1_x_0x1"), None);
    }

    #[test]
    fn test_single_literal_match_selects_dll() {
        let program = MemoryProgram::new("p").with_string("SHFOLDER.DLL").with_string("hello");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(database()));
        assert_eq!(resolver.resolve("SHGetFolderPathA"), Some("shfolder.dll".into()));
    }

    #[test]
    fn test_ambiguous_match_is_unresolved() {
        let program = MemoryProgram::new("p").with_string("shell32").with_string("shfolder.dll");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(database()));
        assert_eq!(resolver.resolve("SHGetFolderPathA"), None);
    }

    #[test]
    fn test_extension_from_literal() {
        let program = MemoryProgram::new("p").with_string("winspool.drv");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(database()));
        assert_eq!(resolver.resolve("OpenPrinterA"), Some("winspool.drv".into()));

        let program = MemoryProgram::new("p").with_string("Advapi32");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(database()));
        assert_eq!(resolver.resolve("GetUserNameA"), Some("advapi32".into()));
    }

    #[test]
    fn test_literal_names_dll() {
        assert!(literal_names_dll("user32.dll", "user32"));
        assert!(literal_names_dll("user32", "user32"));
        assert!(literal_names_dll("winspool.drv", "winspool"));
        assert!(literal_names_dll("winspool.drv", "winspool.drv"));
        assert!(!literal_names_dll("foo.dll", "foo.drv"));
        assert!(!literal_names_dll("foo.ocx", "foo.drv"));
        assert!(!literal_names_dll("user32.dll.mui", "user32"));
    }

    #[test]
    fn test_candidate_extension_must_match() {
        let db = ApiDatabase::from_reader(r#"{"DllRegisterServer": ["foo.drv"]}"#.as_bytes()).unwrap();
        let program = MemoryProgram::new("p").with_string("foo.dll");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(db.clone()));
        assert_eq!(resolver.resolve("DllRegisterServer"), None);

        let program = MemoryProgram::new("p").with_string("FOO.DRV");
        let resolver = Disambiguator::new(&program, LazyApiDatabase::loaded(db));
        assert_eq!(resolver.resolve("DllRegisterServer"), Some("foo.drv".into()));
    }

    #[test]
    fn test_missing_database_disables_lookup() {
        let program = MemoryProgram::new("p").with_string("advapi32.dll");
        let resolver = Disambiguator::new(
            &program,
            LazyApiDatabase::new("/nonexistent/aptscout/apidb.json"),
        );
        assert_eq!(resolver.resolve("GetUserNameA"), None);
        assert!(LazyApiDatabase::disabled().get().is_none());
    }
}
