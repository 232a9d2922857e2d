//! Import table enumeration

use crate::api_dict::ApiDict;
use crate::program::ProgramContext;
use crate::{Error, Result};
use log::debug;
use object::pe::{ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, ImageThunkData, PeFile};
use object::{FileKind, LittleEndian as LE};
use std::path::Path;

/// One statically imported API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Importing library, lower-cased
    pub library: String,
    /// Imported name; MSVC-mangled names are kept mangled, ordinals become `Ordinal_<n>`
    pub name: String,
}

/// The statically declared imports of a binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportTable {
    entries: Vec<ImportEntry>,
}

impl ImportTable {
    /// Collects the external symbols of `program`.
    ///
    /// The import-table name replaces the symbol name when it is an MSVC-mangled name.
    pub fn from_program(program: &dyn ProgramContext) -> Self {
        let entries = program
            .external_symbols()
            .into_iter()
            .map(|symbol| {
                let name = match symbol.original_name {
                    Some(original) if original.starts_with('?') => original,
                    _ => symbol.name,
                };
                ImportEntry {
                    library: symbol.library.to_lowercase(),
                    name,
                }
            })
            .collect();
        ImportTable { entries }
    }

    /// Parses the import directory of a PE32 or PE32+ image.
    pub fn parse_pe(data: &[u8]) -> Result<Self> {
        match FileKind::parse(data)? {
            FileKind::Pe32 => pe_imports::<ImageNtHeaders32>(data),
            FileKind::Pe64 => pe_imports::<ImageNtHeaders64>(data),
            other => Err(Error::Pe(format!("not a PE image ({:?})", other))),
        }
    }

    /// Reads and parses a PE file.
    pub fn load_pe<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse_pe(&std::fs::read(path)?)
    }

    /// Imported APIs in table order
    pub fn entries(&self) -> &[ImportEntry] {
        &self.entries
    }

    /// Groups the entries by DLL.
    pub fn to_api_dict(&self) -> ApiDict {
        let mut dict = ApiDict::new();
        for entry in &self.entries {
            debug!("Import Table entry: {}!{}", entry.library, entry.name);
            dict.insert(&entry.library, &entry.name);
        }
        dict
    }
}

fn pe_imports<Pe: ImageNtHeaders>(data: &[u8]) -> Result<ImportTable> {
    let file = PeFile::<Pe>::parse(data)?;
    let mut entries = Vec::new();

    let Some(import_table) = file.import_table()? else {
        return Ok(ImportTable { entries });
    };

    let mut descriptors = import_table.descriptors()?;
    while let Some(descriptor) = descriptors.next()? {
        let library = String::from_utf8_lossy(import_table.name(descriptor.name.get(LE))?).to_lowercase();

        let thunk_list = match descriptor.original_first_thunk.get(LE) {
            0 => descriptor.first_thunk.get(LE),
            address => address,
        };
        let mut thunks = import_table.thunks(thunk_list)?;

        while let Some(thunk) = thunks.next::<Pe>()? {
            let name = if thunk.is_ordinal() {
                format!("Ordinal_{}", thunk.ordinal())
            } else {
                let (_hint, name) = import_table.hint_name(thunk.address())?;
                String::from_utf8_lossy(name).into_owned()
            };
            entries.push(ImportEntry {
                library: library.clone(),
                name,
            });
        }
    }

    Ok(ImportTable { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::MemoryProgram;

    #[test]
    fn test_from_program_keeps_mangled_names() {
        let program = MemoryProgram::new("it.exe")
            .with_external(0x1000, "KERNEL32.DLL", "GetProcAddress")
            .with_mangled_external(0x1004, "MSVCP140.DLL", "_Xlength_error", "?_Xlength_error@std@@YAXPBD@Z")
            .with_mangled_external(0x1008, "USER32.DLL", "MessageBoxA", "MessageBoxA");

        let table = ImportTable::from_program(&program);
        let dict = table.to_api_dict();
        assert!(dict.contains("kernel32.dll", "GetProcAddress"));
        assert!(dict.contains("msvcp140.dll", "?_Xlength_error@std@@YAXPBD@Z"));
        assert!(dict.contains("user32.dll", "MessageBoxA"));
        assert_eq!(table.entries()[0].library, "kernel32.dll");
    }

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn put_u16(image: &mut [u8], offset: usize, value: u16) {
        put(image, offset, &value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], offset: usize, value: u32) {
        put(image, offset, &value.to_le_bytes());
    }

    /// PE32 image with one `.idata` section at RVA 0x1000, file offset 0x200.
    ///
    /// KERNEL32.dll imports `ExitProcess` through its lookup table. WS2_32.dll has no
    /// lookup table and imports ordinal 115 and `connect` through its address table.
    fn pe32_image() -> Vec<u8> {
        const IDATA: usize = 0x200;
        const RVA: u32 = 0x1000;
        let mut image = vec![0u8; 0x400];

        put(&mut image, 0, b"MZ");
        put_u32(&mut image, 0x3c, 0x40);
        put(&mut image, 0x40, b"PE\0\0");
        put_u16(&mut image, 0x44, 0x14c);
        put_u16(&mut image, 0x46, 1);
        put_u16(&mut image, 0x54, 0xe0);
        put_u16(&mut image, 0x56, 0x0102);

        put_u16(&mut image, 0x58, 0x10b);
        put_u32(&mut image, 0x58 + 28, 0x400000);
        put_u32(&mut image, 0x58 + 32, 0x1000);
        put_u32(&mut image, 0x58 + 36, 0x200);
        put_u32(&mut image, 0x58 + 56, 0x2000);
        put_u32(&mut image, 0x58 + 60, 0x200);
        put_u32(&mut image, 0x58 + 92, 16);
        // import directory
        put_u32(&mut image, 0xc0, RVA);
        put_u32(&mut image, 0xc4, 60);

        put(&mut image, 0x138, b".idata\0\0");
        put_u32(&mut image, 0x138 + 8, 0x200);
        put_u32(&mut image, 0x138 + 12, RVA);
        put_u32(&mut image, 0x138 + 16, 0x200);
        put_u32(&mut image, 0x138 + 20, IDATA as u32);
        put_u32(&mut image, 0x138 + 36, 0xc000_0040);

        // KERNEL32.dll: lookup table at 0x40, address table at 0x50
        put_u32(&mut image, IDATA, RVA + 0x40);
        put_u32(&mut image, IDATA + 12, RVA + 0xa0);
        put_u32(&mut image, IDATA + 16, RVA + 0x50);
        put_u32(&mut image, IDATA + 0x40, RVA + 0x80);
        put_u32(&mut image, IDATA + 0x50, RVA + 0x80);

        // WS2_32.dll: address table only, at 0x60
        put_u32(&mut image, IDATA + 20 + 12, RVA + 0xb0);
        put_u32(&mut image, IDATA + 20 + 16, RVA + 0x60);
        put_u32(&mut image, IDATA + 0x60, 0x8000_0073);
        put_u32(&mut image, IDATA + 0x64, RVA + 0x90);

        put(&mut image, IDATA + 0x82, b"ExitProcess\0");
        put(&mut image, IDATA + 0x92, b"connect\0");
        put(&mut image, IDATA + 0xa0, b"KERNEL32.dll\0");
        put(&mut image, IDATA + 0xb0, b"WS2_32.dll\0");
        image
    }

    #[test]
    fn test_parse_pe32_imports() {
        let table = ImportTable::parse_pe(&pe32_image()).unwrap();
        assert_eq!(
            table.entries(),
            [
                ImportEntry {
                    library: "kernel32.dll".into(),
                    name: "ExitProcess".into(),
                },
                ImportEntry {
                    library: "ws2_32.dll".into(),
                    name: "Ordinal_115".into(),
                },
                ImportEntry {
                    library: "ws2_32.dll".into(),
                    name: "connect".into(),
                },
            ]
        );

        let dict = table.to_api_dict();
        assert!(dict.contains("ws2_32.dll", "Ordinal_115"));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_parse_pe_rejects_other_formats() {
        assert!(ImportTable::parse_pe(b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0").is_err());
        assert!(ImportTable::parse_pe(b"not an executable").is_err());
    }
}
