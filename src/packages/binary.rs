// src/packages/binary.rs

//! Library dependency extraction from contained ELF and PE binaries
//!
//! Uses goblin to analyze binaries found while walking a package archive:
//! - ELF shared objects contribute their `SONAME` as a provide and their
//!   `NEEDED` entries as requirements, keyed `elf-<arch>::<soname>`.
//! - PE binaries contribute the exported DLL name as a provide and imported
//!   DLL names as requirements, keyed `pe-<cpu>::<dll>`.
//! - `.dll.a` import libraries are remembered for a second pass that decides
//!   whether the referenced DLL is provided by this package or required from
//!   another one.

use crate::packages::{ArchiveFile, Package};
use goblin::Object;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const ELF_MAGIC: &[u8] = b"\x7fELF";
const MZ_MAGIC: &[u8] = b"MZ";

/// Whether the content looks like an ELF binary
pub fn is_elf(content: &[u8]) -> bool {
    content.starts_with(ELF_MAGIC)
}

/// Whether the content looks like a PE binary (MZ stub present)
pub fn is_pe(content: &[u8]) -> bool {
    content.starts_with(MZ_MAGIC)
}

/// Map an ELF machine type to the architecture token used in library keys
fn elf_arch(machine: u16) -> &'static str {
    use goblin::elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_RISCV, EM_X86_64};
    match machine {
        EM_X86_64 => "x86_64",
        EM_386 => "i386",
        EM_AARCH64 => "aarch64",
        EM_ARM => "armv7",
        EM_RISCV => "riscv64",
        _ => "unknown",
    }
}

/// Map a COFF machine type to the cpu token used in library keys
fn coff_machine_cpu(machine: u16) -> Option<&'static str> {
    use goblin::pe::header::{COFF_MACHINE_ARM64, COFF_MACHINE_X86, COFF_MACHINE_X86_64};
    match machine {
        COFF_MACHINE_X86 => Some("i386"),
        COFF_MACHINE_X86_64 => Some("x86_64"),
        COFF_MACHINE_ARM64 => Some("aarch64"),
        _ => None,
    }
}

fn pe_cpu(machine: u16) -> &'static str {
    coff_machine_cpu(machine).unwrap_or("unknown")
}

/// DLL references recovered from `.dll.a` import libraries during one
/// archive walk
///
/// Names are keyed `pe-<cpu>::<dll>` like the PE branch of
/// [`add_library_info`]: the cpu is taken from the import library's own COFF
/// members where possible, falling back to the cpu observed on the package's
/// PE binaries (the walk order of the archive does not matter).
#[derive(Debug, Default)]
pub struct ImportLibReferences {
    /// cpu of the package's own PE binaries, used as fallback
    observed_cpu: Option<&'static str>,
    /// referenced DLL name → cpu derived from the import library itself
    names: BTreeMap<String, Option<&'static str>>,
}

impl ImportLibReferences {
    /// Remember the cpu of a PE binary contained in the same package
    pub fn record_cpu(&mut self, cpu: &'static str) {
        if cpu != "unknown" {
            self.observed_cpu.get_or_insert(cpu);
        }
    }

    fn add(&mut self, name: String, cpu: Option<&'static str>) {
        let entry = self.names.entry(name).or_insert(cpu);
        if entry.is_none() {
            *entry = cpu;
        }
    }

    /// The fully-qualified library keys, e.g. `pe-i386::libgcc_s_sjlj-1.dll`
    pub fn into_keys(self) -> BTreeSet<String> {
        let observed_cpu = self.observed_cpu;
        self.names
            .into_iter()
            .map(|(name, cpu)| {
                let cpu = cpu.or(observed_cpu).unwrap_or("unknown");
                format!("pe-{cpu}::{name}")
            })
            .collect()
    }
}

/// Record provides/requires from one contained file
///
/// Files that are neither ELF nor PE are ignored; parse failures are logged
/// and skipped so a single broken binary cannot fail the whole package.
pub fn add_library_info(
    package: &mut Package,
    directory: &str,
    file: &ArchiveFile,
    dlls_referenced_by_import_libs: &mut ImportLibReferences,
) {
    if file.name.ends_with(".dll.a") {
        collect_import_lib_references(&file.content, dlls_referenced_by_import_libs);
        return;
    }
    if !is_elf(&file.content) && !is_pe(&file.content) {
        return;
    }

    match Object::parse(&file.content) {
        Ok(Object::Elf(elf)) => {
            let arch = elf_arch(elf.header.e_machine);
            if let Some(soname) = elf.soname {
                let provide = format!("elf-{arch}::{soname}");
                if !package.libprovides.contains(&provide) {
                    package.libprovides.push(provide);
                }
            }
            for needed in &elf.libraries {
                let requirement = format!("elf-{arch}::{needed}");
                if !package.libdepends.contains(&requirement) {
                    package.libdepends.push(requirement);
                }
            }
        }
        Ok(Object::PE(pe)) => {
            let cpu = pe_cpu(pe.header.coff_header.machine);
            dlls_referenced_by_import_libs.record_cpu(cpu);
            // exported module name; fall back to the file name for DLLs
            // without an export table name
            let export_name = pe
                .name
                .map(|name| name.to_string())
                .or_else(|| {
                    file.name
                        .to_ascii_lowercase()
                        .ends_with(".dll")
                        .then(|| file.name.clone())
                });
            if let Some(name) = export_name {
                let provide = format!("pe-{cpu}::{name}");
                if !package.libprovides.contains(&provide) {
                    package.libprovides.push(provide);
                }
            }
            let mut seen_dlls = BTreeSet::new();
            for import in &pe.imports {
                if seen_dlls.insert(import.dll.to_string()) {
                    let requirement = format!("pe-{cpu}::{}", import.dll);
                    if !package.libdepends.contains(&requirement) {
                        package.libdepends.push(requirement);
                    }
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            debug!(
                "Failed to analyze binary {}/{} in {}: {e}",
                directory, file.name, package.name
            );
        }
    }
}

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;

/// Extract DLL names referenced by a `.dll.a` import library
///
/// Import libraries are ar archives whose members embed the target DLL name
/// as a NUL-terminated string. Each member's COFF header (or short-import
/// signature) also carries the machine type, which determines the
/// `pe-<cpu>` prefix of the recorded reference.
fn collect_import_lib_references(content: &[u8], dlls: &mut ImportLibReferences) {
    if !content.starts_with(AR_MAGIC) {
        // not an ar archive after all; scan the raw content
        scan_dll_strings(content, None, dlls);
        return;
    }
    let mut offset = AR_MAGIC.len();
    while offset + AR_HEADER_LEN <= content.len() {
        let header = &content[offset..offset + AR_HEADER_LEN];
        let Some(size) = std::str::from_utf8(&header[48..58])
            .ok()
            .and_then(|size| size.trim().parse::<usize>().ok())
        else {
            break;
        };
        let data_start = offset + AR_HEADER_LEN;
        let data_end = (data_start + size).min(content.len());
        let member = &content[data_start..data_end];
        scan_dll_strings(member, member_machine_cpu(member), dlls);
        // members are aligned to even offsets
        offset = data_start + size + (size & 1);
    }
}

/// The cpu token of one ar member, read from its COFF header or, for short
/// import descriptors, from the machine field behind the 0x0000/0xffff
/// signature
fn member_machine_cpu(member: &[u8]) -> Option<&'static str> {
    if member.len() < 2 {
        return None;
    }
    let machine = if member.starts_with(b"\x00\x00\xff\xff") && member.len() >= 8 {
        u16::from_le_bytes([member[6], member[7]])
    } else {
        u16::from_le_bytes([member[0], member[1]])
    };
    coff_machine_cpu(machine)
}

fn scan_dll_strings(data: &[u8], cpu: Option<&'static str>, dlls: &mut ImportLibReferences) {
    let mut current = Vec::new();
    for &byte in data {
        if byte.is_ascii_graphic() && byte != b'/' {
            current.push(byte);
            continue;
        }
        flush_dll_candidate(&mut current, cpu, dlls);
    }
    flush_dll_candidate(&mut current, cpu, dlls);
}

fn flush_dll_candidate(
    current: &mut Vec<u8>,
    cpu: Option<&'static str>,
    dlls: &mut ImportLibReferences,
) {
    if current.len() > 4 && current.to_ascii_lowercase().ends_with(b".dll") {
        if let Ok(name) = String::from_utf8(std::mem::take(current)) {
            dlls.add(name, cpu);
        }
    }
    current.clear();
}

/// Build a minimal ar-format import library for tests: one COFF member with
/// the given machine type whose data embeds the DLL names
#[cfg(test)]
pub fn test_import_library(machine: u16, dll_names: &[&str]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&machine.to_le_bytes());
    data.extend_from_slice(&[0u8; 18]);
    for name in dll_names {
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }

    let mut archive = Vec::new();
    archive.extend_from_slice(AR_MAGIC);
    archive.extend_from_slice(format!("{:<16}", "d000000.o/").as_bytes());
    archive.extend_from_slice(format!("{:<12}", 0).as_bytes());
    archive.extend_from_slice(format!("{:<6}", 0).as_bytes());
    archive.extend_from_slice(format!("{:<6}", 0).as_bytes());
    archive.extend_from_slice(format!("{:<8}", 644).as_bytes());
    archive.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
    archive.extend_from_slice(b"`\n");
    archive.extend_from_slice(&data);
    if data.len() % 2 == 1 {
        archive.push(b'\n');
    }
    archive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_detection() {
        assert!(is_elf(b"\x7fELF\x02\x01\x01"));
        assert!(!is_elf(b"#!/bin/sh"));
        assert!(is_pe(b"MZ\x90\x00"));
        assert!(!is_pe(b"\x7fELF"));
    }

    #[test]
    fn test_arch_mapping() {
        use goblin::elf::header::{EM_386, EM_X86_64};
        assert_eq!(elf_arch(EM_X86_64), "x86_64");
        assert_eq!(elf_arch(EM_386), "i386");
        assert_eq!(elf_arch(0xffff), "unknown");
    }

    #[test]
    fn test_cpu_mapping() {
        use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
        assert_eq!(pe_cpu(COFF_MACHINE_X86), "i386");
        assert_eq!(pe_cpu(COFF_MACHINE_X86_64), "x86_64");
        assert_eq!(pe_cpu(0xffff), "unknown");
    }

    #[test]
    fn test_import_lib_references_are_keyed_by_member_machine() {
        use goblin::pe::header::COFF_MACHINE_X86;
        let content = test_import_library(COFF_MACHINE_X86, &["libgcc_s_sjlj-1.dll"]);

        let mut package = Package::new("mingw-w64-harfbuzz", "1.4.2-1");
        let mut dlls = ImportLibReferences::default();
        let file = ArchiveFile {
            name: "libharfbuzz.dll.a".to_string(),
            content,
        };
        add_library_info(&mut package, "usr/i686-w64-mingw32/lib", &file, &mut dlls);

        let keys = dlls.into_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("pe-i386::libgcc_s_sjlj-1.dll"), "keys: {keys:?}");
    }

    #[test]
    fn test_import_lib_references_fall_back_to_observed_cpu() {
        // raw (non-ar) content: no member machine to read
        let mut dlls = ImportLibReferences::default();
        collect_import_lib_references(b"garbage\0libwinpthread-1.dll\0", &mut dlls);
        dlls.record_cpu("i386");
        let keys = dlls.into_keys();
        assert!(keys.contains("pe-i386::libwinpthread-1.dll"), "keys: {keys:?}");

        // without any observed cpu the token stays unknown
        let mut dlls = ImportLibReferences::default();
        collect_import_lib_references(b"garbage\0libwinpthread-1.dll\0", &mut dlls);
        let keys = dlls.into_keys();
        assert!(keys.contains("pe-unknown::libwinpthread-1.dll"), "keys: {keys:?}");
    }

    #[test]
    fn test_non_binary_is_ignored() {
        let mut package = Package::new("test", "1-1");
        let mut dlls = ImportLibReferences::default();
        let file = ArchiveFile {
            name: "README".to_string(),
            content: b"just text".to_vec(),
        };
        add_library_info(&mut package, "usr/share/doc", &file, &mut dlls);
        assert!(package.libprovides.is_empty());
        assert!(package.libdepends.is_empty());
    }

    #[test]
    fn test_truncated_elf_does_not_panic() {
        let mut package = Package::new("test", "1-1");
        let mut dlls = ImportLibReferences::default();
        let file = ArchiveFile {
            name: "libbroken.so".to_string(),
            content: b"\x7fELF\x02\x01".to_vec(),
        };
        add_library_info(&mut package, "usr/lib", &file, &mut dlls);
        assert!(package.libprovides.is_empty());
    }
}
