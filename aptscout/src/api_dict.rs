//! DLL to API-name mapping

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// DLL extensions kept as they are; anything else gets `.dll` appended
pub const MODULE_EXTENSIONS: [&str; 3] = [".dll", ".drv", ".ocx"];

/// Lower-cases a DLL name and appends `.dll` unless it already carries a module extension.
///
/// ```
/// use aptscout::normalize_dll_name;
///
/// assert_eq!(normalize_dll_name("USER32"), "user32.dll");
/// assert_eq!(normalize_dll_name("winspool.drv"), "winspool.drv");
/// ```
pub fn normalize_dll_name(name: &str) -> String {
    let mut dll = name.trim().to_lowercase();
    if !MODULE_EXTENSIONS.iter().any(|ext| dll.ends_with(ext)) {
        dll.push_str(".dll");
    }
    dll
}

/// Returns the lower-cased DLL name without its module extension.
pub fn dll_base_name(name: &str) -> String {
    let dll = name.trim().to_lowercase();
    MODULE_EXTENSIONS
        .iter()
        .find_map(|ext| dll.strip_suffix(ext))
        .map(String::from)
        .unwrap_or(dll)
}

/// APIs grouped by the DLL exporting them
///
/// DLL keys are always normalised with [`normalize_dll_name`]; API names keep their case.
/// Serialises as a JSON object of sorted arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiDict(BTreeMap<String, BTreeSet<String>>);

impl ApiDict {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `api` under `dll`, returning true if it was not present yet.
    pub fn insert(&mut self, dll: &str, api: &str) -> bool {
        self.0
            .entry(normalize_dll_name(dll))
            .or_default()
            .insert(api.to_string())
    }

    /// Adds every entry of `other`.
    pub fn merge(&mut self, other: &ApiDict) {
        for (dll, apis) in other.iter() {
            self.0.entry(dll.clone()).or_default().extend(apis.iter().cloned());
        }
    }

    /// Returns true if `api` is recorded under `dll`
    pub fn contains(&self, dll: &str, api: &str) -> bool {
        self.0
            .get(&normalize_dll_name(dll))
            .is_some_and(|apis| apis.contains(api))
    }

    /// APIs recorded under `dll`
    pub fn get(&self, dll: &str) -> Option<&BTreeSet<String>> {
        self.0.get(&normalize_dll_name(dll))
    }

    /// Iterates over the DLLs and their APIs in DLL order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Number of DLLs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Total number of `(dll, api)` pairs
    pub fn api_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    /// Returns true if no API was recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ApiDict {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut dict = ApiDict::new();
        for (dll, api) in iter {
            dict.insert(dll, api);
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dll_name() {
        assert_eq!(normalize_dll_name("user32"), "user32.dll");
        assert_eq!(normalize_dll_name("KERNEL32.DLL"), "kernel32.dll");
        assert_eq!(normalize_dll_name("winspool.drv"), "winspool.drv");
        assert_eq!(normalize_dll_name("MSCOMCTL.OCX"), "mscomctl.ocx");
        assert_eq!(dll_base_name("WinSpool.drv"), "winspool");
        assert_eq!(dll_base_name("shell32"), "shell32");
    }

    #[test]
    fn test_insert_dedupes_and_keeps_case() {
        let mut dict = ApiDict::new();
        assert!(dict.insert("User32", "MessageBoxA"));
        assert!(!dict.insert("user32.dll", "MessageBoxA"));
        assert!(dict.insert("user32.dll", "MessageBoxW"));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.api_count(), 2);
        assert!(dict.contains("USER32.DLL", "MessageBoxW"));
        assert!(!dict.contains("user32", "messageboxw"));
    }

    #[test]
    fn test_serializes_sorted() {
        let dict: ApiDict = [("shell32", "ShellAboutA"), ("kernel32", "GetLogicalDrives"), ("shell32", "IsUserAnAdmin")]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&dict).unwrap();
        assert_eq!(
            json,
            r#"{"kernel32.dll":["GetLogicalDrives"],"shell32.dll":["IsUserAnAdmin","ShellAboutA"]}"#
        );
    }

    #[test]
    fn test_merge() {
        let mut a: ApiDict = [("kernel32", "GetCurrentProcessId")].into_iter().collect();
        let b: ApiDict = [("kernel32", "GetCurrentThreadId"), ("advapi32", "GetUserNameA")]
            .into_iter()
            .collect();
        a.merge(&b);
        assert_eq!(a.api_count(), 3);
        assert_eq!(a.len(), 2);
    }
}
