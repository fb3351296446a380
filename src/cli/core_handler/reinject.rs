use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use eyre::{eyre, Result};
use log::debug;
use scroll::Pwrite;
use tempfile::NamedTempFile;

use crate::cli::core_handler::core_image::CoreImage;
use crate::cli::core_handler::elf;
use crate::cli::core_handler::memory_range::Segment;
use crate::cli::core_handler::ElfPtrSize;

use elf::program_header::{ProgramHeader, PT_LOAD, SIZEOF_PHDR};

/// Replaces the kernel-written text stub of the segment covering
/// `target_vaddr` with the full text image, shifting the offsets of all later
/// PT_LOADs. The rewrite goes to a temporary sibling which then atomically
/// replaces the core. Returns the offset shift applied to later segments.
///
/// The caller must reload the [`CoreImage`] before using any offsets again.
pub fn reinject_text(core: &CoreImage, target_vaddr: ElfPtrSize, image: &[u8]) -> Result<ElfPtrSize> {
    let program_headers = core.program_headers();
    let text_idx = program_headers
        .iter()
        .position(|ph| {
            ph.p_type == PT_LOAD
                && Segment::new(ph.p_vaddr, ph.p_memsz, ph.p_offset).contains(target_vaddr)
        })
        .ok_or_else(|| eyre!("No PT_LOAD covers text at {:#x}", target_vaddr))?;

    let text_ph = program_headers[text_idx];
    if image.len() as ElfPtrSize != text_ph.p_memsz {
        return Err(eyre!(
            "Text image is {} bytes, segment wants {}",
            image.len(),
            text_ph.p_memsz
        ));
    }

    // The stub ends where the next PT_LOAD begins. A text segment without a
    // following load cannot be reinjected.
    let next_offset = program_headers[text_idx + 1..]
        .iter()
        .find(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.p_offset)
        .ok_or_else(|| eyre!("Text at {:#x} is the last PT_LOAD", target_vaddr))?;

    let text_offset = text_ph.p_offset;
    if next_offset <= text_offset {
        return Err(eyre!("Core program headers are not sorted by offset"));
    }
    let stub_size = next_offset - text_offset;
    let delta = image.len() as ElfPtrSize - stub_size;
    debug!(
        "Reinjecting {:#x} bytes at offset {:#x} (stub {:#x}, shift {:#x})",
        image.len(),
        text_offset,
        stub_size,
        delta
    );

    let mut patched = program_headers.to_vec();
    patched[text_idx].p_filesz = patched[text_idx].p_memsz;
    for ph in patched[text_idx + 1..]
        .iter_mut()
        .filter(|ph| ph.p_type == PT_LOAD)
    {
        ph.p_offset += delta;
    }

    write_rewritten_core(core, &patched, text_offset as usize, next_offset as usize, image)?;
    Ok(delta)
}

fn write_rewritten_core(
    core: &CoreImage,
    patched_headers: &[ProgramHeader],
    text_offset: usize,
    next_offset: usize,
    image: &[u8],
) -> Result<()> {
    let data = core.data();
    let ph_start = core.elf_header().e_phoff as usize;
    let ph_end = ph_start + patched_headers.len() * SIZEOF_PHDR;
    if ph_end > text_offset {
        return Err(eyre!("Program header table overlaps the text segment"));
    }

    let mut ph_bytes = vec![0u8; patched_headers.len() * SIZEOF_PHDR];
    for (i, ph) in patched_headers.iter().enumerate() {
        ph_bytes.pwrite_with(*ph, i * SIZEOF_PHDR, scroll::NATIVE)?;
    }

    let parent = core.path().parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&data[..ph_start])?;
    tmp.write_all(&ph_bytes)?;
    tmp.write_all(&data[ph_end..text_offset])?;
    tmp.write_all(image)?;
    tmp.write_all(&data[next_offset..])?;
    tmp.flush()?;

    tmp.persist(core.path())
        .map_err(|e| eyre!("Failed to replace {}: {}", core.path().display(), e))?;
    fs::set_permissions(core.path(), fs::Permissions::from_mode(0o777))?;
    Ok(())
}
