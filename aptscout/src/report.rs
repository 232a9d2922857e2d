//! JSON API log, one file per analysed binary

use crate::api_dict::ApiDict;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Imports found in one binary
///
/// ```json
/// { "it": { "kernel32.dll": ["GetProcAddress"] },
///   "dynamic": { "user32.dll": ["MessageBoxA"] } }
/// ```
/// A key is omitted when that kind of import was not requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiLog {
    /// Import table entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub it: Option<ApiDict>,
    /// Imports resolved at run time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<ApiDict>,
}

impl ApiLog {
    /// Serialises the log with 4-space indentation.
    pub fn to_json(&self) -> Result<String> {
        to_pretty_json(self)
    }

    /// Writes `<hash>.json` into `dir`, creating the directory if needed.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P, hash: &str) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", hash));
        std::fs::write(&path, self.to_json()?)?;
        Ok(path)
    }

    /// Reads a log back.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Serialises `value` as JSON indented by four spaces.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Hex SHA-1 digest of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-1 digest of a file's contents
pub fn file_sha1<P: AsRef<Path>>(path: P) -> Result<String> {
    Ok(sha1_hex(&std::fs::read(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ApiLog {
        ApiLog {
            it: Some([("KERNEL32.DLL", "GetProcAddress")].into_iter().collect()),
            dynamic: Some([("user32", "MessageBoxA")].into_iter().collect()),
        }
    }

    #[test]
    fn test_to_json_layout() {
        let json = log().to_json().unwrap();
        let expected = "{\n    \"it\": {\n        \"kernel32.dll\": [\n            \"GetProcAddress\"\n        ]\n    },\n    \
                        \"dynamic\": {\n        \"user32.dll\": [\n            \"MessageBoxA\"\n        ]\n    }\n}";
        assert_eq!(json, expected);
    }

    #[test]
    fn test_missing_key_is_omitted() {
        let only_dynamic = ApiLog {
            it: None,
            dynamic: Some(ApiDict::new()),
        };
        assert_eq!(only_dynamic.to_json().unwrap(), "{\n    \"dynamic\": {}\n}");
    }

    #[test]
    fn test_write_and_load() {
        let dir = std::env::temp_dir().join(format!("aptscout-report-{}", std::process::id()));
        let path = log().write_to_dir(&dir, "abc123").unwrap();
        assert_eq!(path.file_name().unwrap(), "abc123.json");
        assert_eq!(ApiLog::load(&path).unwrap(), log());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sha1_hex() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
