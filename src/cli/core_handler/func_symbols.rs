use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;

use eyre::{eyre, Result};
use gimli::{BaseAddresses, CieOrFde, EhFrame, NativeEndian, UnwindSection};
use log::{debug, warn};
use scroll::{Pread, Pwrite};

use crate::cli::core_handler::core_image::CoreImage;
use crate::cli::core_handler::elf;
use crate::cli::core_handler::sections::SectionPlan;
use crate::cli::core_handler::ElfPtrSize;

use elf::section_header::{SectionHeader, SIZEOF_SHDR};
use elf::sym::{Sym, SIZEOF_SYM};
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC};

/// A function recovered from the unwind tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRange {
    pub addr: ElfPtrSize,
    pub size: ElfPtrSize,
}

/// The one contract consumed from the unwind machinery: every function's
/// (address, size) pair.
pub trait FunctionWalker {
    fn enumerate_functions(&self, eh_frame: &[u8], vaddr: ElfPtrSize) -> Result<Vec<FuncRange>>;
}

/// FDE walker over a raw .eh_frame byte range.
pub struct EhFrameWalker;

impl FunctionWalker for EhFrameWalker {
    fn enumerate_functions(&self, eh_frame: &[u8], vaddr: ElfPtrSize) -> Result<Vec<FuncRange>> {
        let section = EhFrame::new(eh_frame, NativeEndian);
        let bases = BaseAddresses::default().set_eh_frame(vaddr as u64);

        let mut functions = Vec::new();
        let mut entries = section.entries(&bases);
        loop {
            match entries.next() {
                Ok(None) => break,
                Ok(Some(CieOrFde::Cie(_))) => {}
                Ok(Some(CieOrFde::Fde(partial))) => {
                    match partial.parse(EhFrame::cie_from_offset) {
                        Ok(fde) => functions.push(FuncRange {
                            addr: fde.initial_address() as ElfPtrSize,
                            size: fde.len() as ElfPtrSize,
                        }),
                        Err(e) => warn!("Skipping unparsable FDE: {}", e),
                    }
                }
                Err(e) => return Err(eyre!("eh_frame walk failed: {}", e)),
            }
        }
        Ok(functions)
    }
}

/// Recovers `(address, size)` pairs for the program's functions from the
/// unwind tables, appends a `.symtab`/`.strtab` pair to the file tail and
/// patches the placeholder headers the synthesizer wrote. Also sizes
/// `.got.plt` from the dynamic symbol count. Returns the number of symbols
/// reconstructed.
pub fn reconstruct_local_symbols<W: Read + Write + Seek>(
    output: &mut W,
    core: &CoreImage,
    plan: &SectionPlan,
    walker: &dyn FunctionWalker,
) -> Result<usize> {
    let mut functions = match plan.eh_frame {
        Some(eh_frame) => {
            let start = eh_frame.offset as usize;
            let end = (start + eh_frame.size as usize).min(core.len());
            match core.data().get(start..end) {
                Some(bytes) => walker
                    .enumerate_functions(bytes, eh_frame.vaddr)
                    .unwrap_or_else(|e| {
                        warn!("No symbols reconstructed: {}", e);
                        Vec::new()
                    }),
                None => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    functions.sort_by_key(|f| f.addr);
    functions.dedup_by_key(|f| f.addr);
    debug!("Reconstructed {} functions from eh_frame", functions.len());

    // Null symbol first, then one STT_FUNC per function, named by address.
    let mut strtab = vec![0u8];
    let mut symtab = vec![0u8; (functions.len() + 1) * SIZEOF_SYM];
    for (i, function) in functions.iter().enumerate() {
        let st_name = strtab.len() as u32;
        strtab.extend_from_slice(format!("sub_{:x}", function.addr).as_bytes());
        strtab.push(0);

        let sym = Sym {
            st_name,
            st_info: (STB_GLOBAL << 4) | STT_FUNC,
            st_other: 0,
            st_shndx: plan.text_index as u16,
            st_value: function.addr,
            st_size: function.size,
        };
        symtab.pwrite_with(sym, (i + 1) * SIZEOF_SYM, scroll::NATIVE)?;
    }

    let symtab_offset = output.seek(SeekFrom::End(0))?;
    output.write_all(&symtab)?;
    let strtab_offset = output.stream_position()?;
    output.write_all(&strtab)?;

    patch_section_header(output, plan, plan.symtab_index, |header| {
        header.sh_offset = symtab_offset as ElfPtrSize;
        header.sh_size = symtab.len() as ElfPtrSize;
    })?;
    patch_section_header(output, plan, plan.strtab_index, |header| {
        header.sh_offset = strtab_offset as ElfPtrSize;
        header.sh_size = strtab.len() as ElfPtrSize;
    })?;

    if let Some(got_plt_index) = plan.got_plt_index {
        let dsymcount = plan.dynsym_size / SIZEOF_SYM as ElfPtrSize;
        let ptr_size = size_of::<ElfPtrSize>() as ElfPtrSize;
        patch_section_header(output, plan, got_plt_index, |header| {
            header.sh_size = (dsymcount + 3) * ptr_size;
        })?;
    }

    Ok(functions.len())
}

fn patch_section_header<W: Read + Write + Seek>(
    output: &mut W,
    plan: &SectionPlan,
    index: usize,
    patch: impl FnOnce(&mut SectionHeader),
) -> Result<()> {
    let position = plan.e_shoff + (index * SIZEOF_SHDR) as u64;
    let mut buf = vec![0u8; SIZEOF_SHDR];
    output.seek(SeekFrom::Start(position))?;
    output.read_exact(&mut buf)?;

    let mut header: SectionHeader = buf.pread_with(0, scroll::NATIVE)?;
    patch(&mut header);
    buf.pwrite_with(header, 0, scroll::NATIVE)?;

    output.seek(SeekFrom::Start(position))?;
    output.write_all(&buf)?;
    Ok(())
}
