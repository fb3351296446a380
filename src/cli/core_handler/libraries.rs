use std::ffi::CStr;
use std::path::{Path, PathBuf};

use log::warn;
use procfs::process::MMPermissions;

use crate::cli::core_handler::core_image::CoreImage;
use crate::cli::core_handler::layout::DynamicInfo;
use crate::cli::core_handler::procfs::{Mapping, MappingKind};
use crate::cli::core_handler::ElfPtrSize;

/// One file-backed mapping region of a shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRecord {
    pub path: PathBuf,
    pub name: String,
    pub base: ElfPtrSize,
    pub size: ElfPtrSize,
    pub perms: MMPermissions,
    /// Offset of the region in the reconstructed core; zero until assigned.
    pub offset: ElfPtrSize,
    pub injected: bool,
}

impl LibraryRecord {
    pub fn is_executable(&self) -> bool {
        self.perms.contains(MMPermissions::EXECUTE)
    }

    pub fn is_writable(&self) -> bool {
        self.perms.contains(MMPermissions::WRITE)
    }

    pub fn is_readable(&self) -> bool {
        self.perms.contains(MMPermissions::READ)
    }
}

/// Builds one record per shared-object mapping, in address order. Guard
/// regions of a shared object (no permissions) are carried too; they become
/// the `.undef` sections.
pub fn collect_libraries(maps: &[Mapping]) -> Vec<LibraryRecord> {
    maps.iter()
        .filter(|m| match m.kind {
            MappingKind::SharedObject => true,
            MappingKind::Padding => m
                .path
                .as_deref()
                .map_or(false, |p| p.to_string_lossy().contains(".so")),
            _ => false,
        })
        .filter_map(|m| {
            let path = m.path.clone()?;
            let name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into());
            Some(LibraryRecord {
                path,
                name,
                base: m.start,
                size: m.size(),
                perms: m.perms,
                offset: 0,
                injected: false,
            })
        })
        .collect()
}

/// Fills in each record's offset in the (reloaded) core.
pub fn assign_core_offsets(libraries: &mut [LibraryRecord], core: &CoreImage) {
    for library in libraries.iter_mut() {
        match core.offset_of(library.base) {
            Some(offset) => library.offset = offset,
            None => warn!(
                "{} at {:#x} has no image in the core",
                library.name, library.base
            ),
        }
    }
}

/// Resolves the DT_NEEDED names out of .dynstr in the core's memory image.
pub fn resolve_needed_names(core: &CoreImage, dyn_info: &DynamicInfo) -> Vec<String> {
    let dynstr = match dyn_info.dynstr {
        Some(dynstr) if dyn_info.strsz > 0 => dynstr,
        _ => return Vec::new(),
    };
    let table = match core
        .data()
        .get(dynstr.offset as usize..(dynstr.offset + dyn_info.strsz) as usize)
    {
        Some(table) => table,
        None => return Vec::new(),
    };

    dyn_info
        .needed
        .iter()
        .filter_map(|str_offset| {
            let tail = table.get(*str_offset as usize..)?;
            CStr::from_bytes_until_nul(tail)
                .ok()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .collect()
}

/// Marks shared objects that are neither a DT_NEEDED dependency (directly
/// referenced by the executable) nor the program interpreter. Transitive
/// dependencies of needed libraries are resolved by basename prefix, so a
/// renamed or freshly dlopen'ed object is what ends up flagged.
pub fn mark_injected_libraries(
    libraries: &mut [LibraryRecord],
    needed: &[String],
    interp_path: Option<&Path>,
) {
    let interp_name = interp_path
        .and_then(Path::file_name)
        .map(|f| f.to_string_lossy().into_owned());

    for library in libraries.iter_mut() {
        let is_needed = needed.iter().any(|n| *n == library.name);
        let is_interp = interp_name.as_deref() == Some(library.name.as_str());
        let is_loader = library.name.starts_with("ld-") || library.name.starts_with("ld.so");
        if !is_needed && !is_interp && !is_loader {
            library.injected = true;
        }
    }
}
