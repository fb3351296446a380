use std::fs;
use std::path::Path;

use eyre::{eyre, Result};
use goblin::elf::program_header::{PF_W, PF_X, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_INTERP, PT_LOAD};
use goblin::elf::Elf;
use log::{debug, warn};
use scroll::Pread;

use crate::cli::core_handler::core_image::CoreImage;
use crate::cli::core_handler::elf;
use crate::cli::core_handler::memory_range::Segment;
use crate::cli::core_handler::process_state::ProcessState;
use crate::cli::core_handler::ElfPtrSize;

use elf::dynamic::Dyn;
// Tag constants from the width-agnostic module; `d_tag` is widened before
// matching so the same code serves both classes.
use goblin::elf::dynamic::{
    DT_FINI, DT_GNU_HASH, DT_HASH, DT_INIT, DT_JMPREL, DT_NEEDED, DT_PLTGOT, DT_PLTREL,
    DT_PLTRELSZ, DT_REL, DT_RELA, DT_STRSZ, DT_STRTAB, DT_SYMTAB,
};

/// Size written for a section whose real extent could not be recovered
/// (stripped executable, missing dynamic tag).
pub const FALLBACK_SECTION_SIZE: ElfPtrSize = 64;

/// One row of the layout table: a virtual address, its offset in the
/// reconstructed core, and a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutEntry {
    pub vaddr: ElfPtrSize,
    pub offset: ElfPtrSize,
    pub size: ElfPtrSize,
}

impl LayoutEntry {
    pub fn new(vaddr: ElfPtrSize, offset: ElfPtrSize, size: ElfPtrSize) -> Self {
        Self {
            vaddr,
            offset,
            size,
        }
    }
}

/// A dynamic-tag-derived address paired with its core file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynEntry {
    pub vaddr: ElfPtrSize,
    pub offset: ElfPtrSize,
}

/// Addresses harvested from the PT_DYNAMIC tag array.
#[derive(Debug, Default)]
pub struct DynamicInfo {
    pub rel: Option<DynEntry>,
    pub rel_is_rela: bool,
    pub jmprel: Option<DynEntry>,
    pub plt_uses_rela: bool,
    pub pltgot: Option<DynEntry>,
    pub hash: Option<DynEntry>,
    pub init: Option<DynEntry>,
    pub fini: Option<DynEntry>,
    pub dynsym: Option<DynEntry>,
    pub dynstr: Option<DynEntry>,
    pub strsz: ElfPtrSize,
    pub pltrelsz: ElfPtrSize,
    /// .dynstr offsets of the DT_NEEDED entries.
    pub needed: Vec<ElfPtrSize>,
}

/// Joined view of the executable, the NT_FILE table, and the core's program
/// headers: every virtual address and core file offset the section
/// synthesizer needs.
#[derive(Debug)]
pub struct LayoutTable {
    pub pie: bool,
    pub static_linked: bool,
    /// Relocation base B: the runtime text base for PIE, zero otherwise.
    pub reloc_base: ElfPtrSize,
    pub entry_point: ElfPtrSize,
    pub text: LayoutEntry,
    /// File-backed part of the data segment; `size` is p_filesz.
    pub data: LayoutEntry,
    pub bss: LayoutEntry,
    pub note: LayoutEntry,
    pub interp: Option<LayoutEntry>,
    pub dynamic: Option<LayoutEntry>,
    pub eh_frame_hdr: Option<LayoutEntry>,
    pub eh_frame: Option<LayoutEntry>,
    pub dyn_info: DynamicInfo,
}

/// Program header data lifted out of the on-disk executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhView {
    pub vaddr: ElfPtrSize,
    pub offset: ElfPtrSize,
    pub filesz: ElfPtrSize,
    pub memsz: ElfPtrSize,
    pub flags: u32,
}

impl From<&goblin::elf::ProgramHeader> for PhView {
    fn from(ph: &goblin::elf::ProgramHeader) -> Self {
        Self {
            vaddr: ph.p_vaddr as ElfPtrSize,
            offset: ph.p_offset as ElfPtrSize,
            filesz: ph.p_filesz as ElfPtrSize,
            memsz: ph.p_memsz as ElfPtrSize,
            flags: ph.p_flags,
        }
    }
}

/// The original on-disk executable: its load layout, linking mode, entry
/// point, and (when not stripped) its section header table, which doubles as
/// the size side-channel for the synthesizer.
#[derive(Debug)]
pub struct ExeImage {
    pub entry: ElfPtrSize,
    pub is_pie: bool,
    pub is_static: bool,
    pub stripped_shdrs: bool,
    pub machine: u16,
    text: PhView,
    data: PhView,
    dynamic: Option<PhView>,
    interp: Option<PhView>,
    eh_frame_hdr: Option<PhView>,
    sections: Vec<(String, ElfPtrSize, ElfPtrSize)>,
}

impl ExeImage {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::parse(&data)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes)?;

        let loads: Vec<_> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .collect();
        // The text load is the one mapping the start of the file; the data
        // load is the writable one further in.
        let text = loads
            .iter()
            .find(|ph| ph.p_offset == 0)
            .map(|ph| PhView::from(*ph))
            .ok_or_else(|| eyre!("Executable has no PT_LOAD at file offset 0"))?;
        let data = loads
            .iter()
            .find(|ph| ph.p_offset != 0 && ph.p_flags & PF_W != 0)
            .map(|ph| PhView::from(*ph))
            .ok_or_else(|| eyre!("Executable has no writable PT_LOAD"))?;

        let is_pie = loads
            .iter()
            .find(|ph| ph.p_flags & PF_X != 0)
            .map_or(false, |ph| ph.p_vaddr == 0);

        let find_ph = |p_type: u32| {
            elf.program_headers
                .iter()
                .find(|ph| ph.p_type == p_type)
                .map(PhView::from)
        };
        let dynamic = find_ph(PT_DYNAMIC);
        let interp = find_ph(PT_INTERP);
        let eh_frame_hdr = find_ph(PT_GNU_EH_FRAME);

        let sections = elf
            .section_headers
            .iter()
            .filter_map(|sh| {
                elf.shdr_strtab.get_at(sh.sh_name).map(|name| {
                    (
                        name.to_string(),
                        sh.sh_addr as ElfPtrSize,
                        sh.sh_size as ElfPtrSize,
                    )
                })
            })
            .collect::<Vec<_>>();

        Ok(Self {
            entry: elf.header.e_entry as ElfPtrSize,
            is_pie,
            is_static: interp.is_none(),
            stripped_shdrs: elf.section_headers.is_empty(),
            machine: elf.header.e_machine,
            text,
            data,
            dynamic,
            interp,
            eh_frame_hdr,
            sections,
        })
    }

    pub fn text(&self) -> PhView {
        self.text
    }

    pub fn data(&self) -> PhView {
        self.data
    }

    /// (sh_addr, sh_size) of the first section matching one of the names.
    pub fn section(&self, names: &[&str]) -> Option<(ElfPtrSize, ElfPtrSize)> {
        names.iter().find_map(|wanted| {
            self.sections
                .iter()
                .find(|(name, _, _)| name == wanted)
                .map(|(_, addr, size)| (*addr, *size))
        })
    }

    /// Side-channel size lookup, with the sentinel fallback for stripped
    /// executables.
    pub fn section_size_or_fallback(&self, names: &[&str]) -> ElfPtrSize {
        self.section(names)
            .map(|(_, size)| size)
            .unwrap_or(FALLBACK_SECTION_SIZE)
    }
}

/// Iterator over the entries in a dynamic segment.
struct DynIter {
    data: Vec<u8>,
    offset: usize,
}

impl DynIter {
    fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }
}

impl Iterator for DynIter {
    type Item = Dyn;

    fn next(&mut self) -> Option<Self::Item> {
        self.data.gread::<Dyn>(&mut self.offset).ok()
    }
}

/// Computes the layout table for the dumped process.
pub fn resolve_layout(
    exe: &ExeImage,
    state: &ProcessState,
    core: &CoreImage,
    exe_comm: &str,
) -> Result<LayoutTable> {
    // Relocation base: PIE executables load at the base the kernel recorded
    // in the NT_FILE table; fixed binaries at their link-time addresses.
    let reloc_base = if exe.is_pie {
        state
            .mapped_files
            .find_by_basename(exe_comm)
            .map(|entry| entry.start_addr)
            .ok_or_else(|| eyre!("No NT_FILE mapping for executable '{}'", exe_comm))?
    } else {
        0
    };
    debug!("Relocation base: {:#x}", reloc_base);

    let text_vaddr = reloc_base + exe.text().vaddr;
    let text_offset = core
        .offset_of(text_vaddr)
        .ok_or_else(|| eyre!("Core has no load segment for text at {:#x}", text_vaddr))?;
    let text = LayoutEntry::new(text_vaddr, text_offset, exe.text().memsz);

    let data_vaddr = reloc_base + exe.data().vaddr;
    let data_offset = core
        .offset_of(data_vaddr)
        .ok_or_else(|| eyre!("Core has no load segment for data at {:#x}", data_vaddr))?;
    let data_filesz = exe.data().filesz;
    let data = LayoutEntry::new(data_vaddr, data_offset, data_filesz);
    let bss = LayoutEntry::new(
        data_vaddr + data_filesz,
        data_offset + data_filesz,
        exe.data().memsz - data_filesz,
    );

    let note = LayoutEntry::new(0, core.note_offset() as ElfPtrSize, core.note_bytes().len() as ElfPtrSize);

    let biased_entry = |ph: PhView, size: ElfPtrSize| -> Option<LayoutEntry> {
        let vaddr = reloc_base + ph.vaddr;
        match core.offset_of(vaddr) {
            Some(offset) => Some(LayoutEntry::new(vaddr, offset, size)),
            None => {
                warn!("Core has no load segment covering {:#x}", vaddr);
                None
            }
        }
    };

    let interp = exe.interp.and_then(|ph| biased_entry(ph, ph.filesz));
    let eh_frame_hdr = exe.eh_frame_hdr.and_then(|ph| biased_entry(ph, ph.memsz));

    let dynamic = match exe.dynamic {
        Some(ph) => {
            let vaddr = reloc_base + ph.vaddr;
            let offset = core
                .offset_of(vaddr)
                .ok_or_else(|| eyre!("Dynamic segment at {:#x} missing from core", vaddr))?;
            Some(LayoutEntry::new(vaddr, offset, ph.memsz))
        }
        None => None,
    };

    let dyn_info = match &dynamic {
        Some(dynamic) => walk_dynamic_tags(core, dynamic, &text, &data, &bss, reloc_base, exe.is_pie)?,
        None => DynamicInfo::default(),
    };

    let eh_frame = resolve_eh_frame(exe, core, &eh_frame_hdr, reloc_base);

    Ok(LayoutTable {
        pie: exe.is_pie,
        static_linked: exe.is_static,
        reloc_base,
        entry_point: reloc_base + exe.entry,
        text,
        data,
        bss,
        note,
        interp,
        dynamic,
        eh_frame_hdr,
        eh_frame,
        dyn_info,
    })
}

/// The eh_frame address has two provenances: the executable's own section
/// headers when present (the only source for statically linked binaries), or
/// a derivation from the PT_GNU_EH_FRAME segment end for stripped dynamic
/// executables. Unresolvable for stripped static binaries.
fn resolve_eh_frame(
    exe: &ExeImage,
    core: &CoreImage,
    eh_frame_hdr: &Option<LayoutEntry>,
    reloc_base: ElfPtrSize,
) -> Option<LayoutEntry> {
    let (vaddr, size) = match exe.section(&[".eh_frame"]) {
        Some((addr, size)) => (reloc_base + addr, size),
        None => {
            let hdr = match eh_frame_hdr {
                Some(hdr) => hdr,
                None => {
                    warn!("eh_frame address not recoverable; section omitted");
                    return None;
                }
            };
            // .eh_frame immediately follows .eh_frame_hdr in link order.
            let vaddr = (hdr.vaddr + hdr.size + 3) & !3;
            (vaddr, FALLBACK_SECTION_SIZE)
        }
    };

    match core.offset_of(vaddr) {
        Some(offset) => Some(LayoutEntry::new(vaddr, offset, size)),
        None => {
            warn!("Core has no load segment for eh_frame at {:#x}", vaddr);
            None
        }
    }
}

/// Walks the PT_DYNAMIC tag array out of the core's memory image and converts
/// every harvested address to a core file offset through the text or data
/// segment it falls in.
fn walk_dynamic_tags(
    core: &CoreImage,
    dynamic: &LayoutEntry,
    text: &LayoutEntry,
    data: &LayoutEntry,
    bss: &LayoutEntry,
    reloc_base: ElfPtrSize,
    pie: bool,
) -> Result<DynamicInfo> {
    let dyn_bytes = core
        .bytes_at(dynamic.vaddr, dynamic.size as usize)
        .ok_or_else(|| eyre!("Dynamic segment bytes missing from core"))?;

    let text_segment = Segment::new(text.vaddr, text.size, text.offset);
    // The data segment spans its file-backed part plus bss for address
    // containment purposes.
    let data_segment = Segment::new(data.vaddr, data.size + bss.size, data.offset);

    let resolve = |d_val: ElfPtrSize| -> Option<DynEntry> {
        // Dynamic pointer entries may or may not have been relocated in the
        // memory image; bias the ones still below the load base.
        let vaddr = if pie && d_val < reloc_base {
            d_val + reloc_base
        } else {
            d_val
        };
        let offset = text_segment
            .offset_of(vaddr)
            .or_else(|| data_segment.offset_of(vaddr));
        match offset {
            Some(offset) => Some(DynEntry { vaddr, offset }),
            None => {
                warn!("Dynamic tag address {:#x} outside text and data", vaddr);
                None
            }
        }
    };

    let mut info = DynamicInfo::default();
    for entry in DynIter::new(dyn_bytes.to_vec()) {
        match entry.d_tag as u64 {
            DT_RELA => {
                info.rel = resolve(entry.d_val);
                info.rel_is_rela = true;
            }
            DT_REL => {
                info.rel = resolve(entry.d_val);
                info.rel_is_rela = false;
            }
            DT_JMPREL => info.jmprel = resolve(entry.d_val),
            DT_PLTREL => info.plt_uses_rela = entry.d_val as u64 == DT_RELA,
            DT_PLTGOT => info.pltgot = resolve(entry.d_val),
            DT_GNU_HASH | DT_HASH => {
                if info.hash.is_none() || entry.d_tag as u64 == DT_GNU_HASH {
                    info.hash = resolve(entry.d_val);
                }
            }
            DT_INIT => info.init = resolve(entry.d_val),
            DT_FINI => info.fini = resolve(entry.d_val),
            DT_SYMTAB => info.dynsym = resolve(entry.d_val),
            DT_STRTAB => info.dynstr = resolve(entry.d_val),
            DT_STRSZ => info.strsz = entry.d_val,
            DT_PLTRELSZ => info.pltrelsz = entry.d_val,
            DT_NEEDED => info.needed.push(entry.d_val),
            _ => {}
        }
    }

    Ok(info)
}

/// Sizes and side-channel addresses the synthesizer falls back to when a
/// quantity is not derivable from the core alone. Replaces the original
/// implementation's lazily-populated process globals with an explicit value
/// threaded through the synthesizer and symbol reconstructor.
#[derive(Debug, Clone, Copy)]
pub struct LayoutOverrides {
    pub hash_size: ElfPtrSize,
    pub rel_dyn_size: ElfPtrSize,
    pub rel_plt_size: ElfPtrSize,
    pub init_size: ElfPtrSize,
    pub fini_size: ElfPtrSize,
    pub plt_size: ElfPtrSize,
    pub got_plt_size: ElfPtrSize,
    pub plt_vaddr: Option<ElfPtrSize>,
    pub stripped: bool,
}

impl LayoutOverrides {
    pub fn from_exe(exe: &ExeImage, table: &LayoutTable) -> Self {
        let rel_plt_size = match exe.section(&[".rela.plt", ".rel.plt"]) {
            Some((_, size)) => size,
            None if table.dyn_info.pltrelsz != 0 => table.dyn_info.pltrelsz,
            None => FALLBACK_SECTION_SIZE,
        };

        Self {
            hash_size: exe.section_size_or_fallback(&[".gnu.hash", ".hash"]),
            rel_dyn_size: exe.section_size_or_fallback(&[".rela.dyn", ".rel.dyn"]),
            rel_plt_size,
            init_size: exe.section_size_or_fallback(&[".init"]),
            fini_size: exe.section_size_or_fallback(&[".fini"]),
            plt_size: exe.section_size_or_fallback(&[".plt"]),
            got_plt_size: exe.section_size_or_fallback(&[".got.plt"]),
            plt_vaddr: exe
                .section(&[".plt"])
                .map(|(addr, _)| table.reloc_base + addr),
            stripped: exe.stripped_shdrs,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cli::core_handler::test_utils::{
        build_test_exe, CoreFixture, ExeFixture, TestSegment,
    };
    use scroll::IOwrite;
    use std::io::Cursor;

    #[test]
    fn test_exe_image_parse_non_pie() {
        let exe_bytes = build_test_exe(&ExeFixture::non_pie_dynamic());
        let exe = ExeImage::parse(&exe_bytes).unwrap();

        assert!(!exe.is_pie);
        assert!(!exe.is_static);
        assert!(exe.stripped_shdrs);
        assert_eq!(exe.text().vaddr, 0x400000);
        assert_eq!(exe.data().vaddr, 0x600000);
    }

    #[test]
    fn test_exe_image_parse_pie_static() {
        let exe_bytes = build_test_exe(&ExeFixture::pie_static());
        let exe = ExeImage::parse(&exe_bytes).unwrap();

        assert!(exe.is_pie);
        assert!(exe.is_static);
    }

    #[test]
    fn test_exe_image_side_channel_sections() {
        let mut fixture = ExeFixture::non_pie_dynamic();
        fixture.sections = vec![
            (".init".into(), 0x400400, 0x20),
            (".plt".into(), 0x400420, 0x40),
            (".eh_frame".into(), 0x400800, 0x100),
        ];
        let exe = ExeImage::parse(&build_test_exe(&fixture)).unwrap();

        assert!(!exe.stripped_shdrs);
        assert_eq!(exe.section(&[".plt"]), Some((0x400420, 0x40)));
        assert_eq!(exe.section_size_or_fallback(&[".init"]), 0x20);
        assert_eq!(
            exe.section_size_or_fallback(&[".gnu.hash", ".hash"]),
            FALLBACK_SECTION_SIZE
        );
    }

    fn make_dyn_bytes(entries: &[(ElfPtrSize, ElfPtrSize)]) -> Vec<u8> {
        let mut cursor = Cursor::new(vec![]);
        for (tag, val) in entries {
            cursor.iowrite::<ElfPtrSize>(*tag).unwrap();
            cursor.iowrite::<ElfPtrSize>(*val).unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_walk_dynamic_tags_offsets() {
        // Text at 0x400000 (offset 0x2000), data at 0x600000 (offset 0x4000):
        let dyn_bytes = make_dyn_bytes(&[
            (DT_SYMTAB as ElfPtrSize, 0x400100),
            (DT_STRTAB as ElfPtrSize, 0x400200),
            (DT_STRSZ as ElfPtrSize, 0x80),
            (DT_PLTGOT as ElfPtrSize, 0x600010),
            (DT_PLTREL as ElfPtrSize, DT_RELA as ElfPtrSize),
            (DT_PLTRELSZ as ElfPtrSize, 0x30),
            (DT_NEEDED as ElfPtrSize, 0x10),
            (goblin::elf::dynamic::DT_NULL as ElfPtrSize, 0),
        ]);

        let fixture = CoreFixture::new(&[1])
            .with_load(TestSegment::new(0x400000, 0x1000, 0x1000))
            .with_load(TestSegment::new(0x600000, 0x1000, 0x1000).with_data(dyn_bytes.clone()));
        let fixture = fixture.write_to_temp_file();
        let core = CoreImage::open(fixture.path()).unwrap();

        let text_offset = core.offset_of(0x400000).unwrap();
        let data_offset = core.offset_of(0x600000).unwrap();
        let text = LayoutEntry::new(0x400000, text_offset, 0x1000);
        let data = LayoutEntry::new(0x600000, data_offset, 0x800);
        let bss = LayoutEntry::new(0x600800, data_offset + 0x800, 0x800);
        let dynamic = LayoutEntry::new(0x600000, data_offset, dyn_bytes.len() as ElfPtrSize);

        let info = walk_dynamic_tags(&core, &dynamic, &text, &data, &bss, 0, false).unwrap();

        assert_eq!(
            info.dynsym,
            Some(DynEntry {
                vaddr: 0x400100,
                offset: text_offset + 0x100
            })
        );
        assert_eq!(
            info.dynstr,
            Some(DynEntry {
                vaddr: 0x400200,
                offset: text_offset + 0x200
            })
        );
        assert_eq!(
            info.pltgot,
            Some(DynEntry {
                vaddr: 0x600010,
                offset: data_offset + 0x10
            })
        );
        assert_eq!(info.strsz, 0x80);
        assert_eq!(info.pltrelsz, 0x30);
        assert!(info.plt_uses_rela);
        assert_eq!(info.needed, vec![0x10]);
    }

    #[test]
    fn test_walk_dynamic_tags_biases_unrelocated_pie_addresses() {
        let base: ElfPtrSize = 0x555555554000;
        let dyn_bytes = make_dyn_bytes(&[
            (DT_SYMTAB as ElfPtrSize, 0x100),
            (goblin::elf::dynamic::DT_NULL as ElfPtrSize, 0),
        ]);

        let fixture = CoreFixture::new(&[1])
            .with_load(TestSegment::new(base, 0x1000, 0x1000).with_data(dyn_bytes.clone()))
            .write_to_temp_file();
        let core = CoreImage::open(fixture.path()).unwrap();

        let text_offset = core.offset_of(base).unwrap();
        let text = LayoutEntry::new(base, text_offset, 0x1000);
        let data = LayoutEntry::new(base + 0x800, text_offset + 0x800, 0x100);
        let bss = LayoutEntry::new(base + 0x900, text_offset + 0x900, 0);
        let dynamic = LayoutEntry::new(base, text_offset, dyn_bytes.len() as ElfPtrSize);

        let info = walk_dynamic_tags(&core, &dynamic, &text, &data, &bss, base, true).unwrap();
        assert_eq!(
            info.dynsym,
            Some(DynEntry {
                vaddr: base + 0x100,
                offset: text_offset + 0x100
            })
        );
    }

    use crate::cli::core_handler::process_state::ProcessState;
    use crate::cli::core_handler::test_utils::build_test_note_segment;

    #[test]
    fn test_resolve_layout_non_pie_dynamic() {
        let exe = ExeImage::parse(&build_test_exe(&ExeFixture::non_pie_dynamic())).unwrap();
        let state = ProcessState::from_note_bytes(&build_test_note_segment(&[7])).unwrap();

        // The dynamic segment bytes live inside the data load at 0xe00:
        let mut data_bytes = vec![0u8; 0x1000];
        let dyn_bytes = make_dyn_bytes(&[
            (DT_SYMTAB as ElfPtrSize, 0x400300),
            (DT_STRTAB as ElfPtrSize, 0x400360),
            (DT_STRSZ as ElfPtrSize, 0x40),
            (goblin::elf::dynamic::DT_NULL as ElfPtrSize, 0),
        ]);
        data_bytes[0xe00..0xe00 + dyn_bytes.len()].copy_from_slice(&dyn_bytes);

        let fixture = CoreFixture::new(&[7])
            .with_load(TestSegment::new(0x400000, 0x1000, 0x1000))
            .with_load(TestSegment::new(0x600000, 0x1000, 0x1000).with_data(data_bytes))
            .write_to_temp_file();
        let core = CoreImage::open(fixture.path()).unwrap();

        let layout = resolve_layout(&exe, &state, &core, "fixture").unwrap();

        assert!(!layout.pie);
        assert!(!layout.static_linked);
        assert_eq!(layout.reloc_base, 0);
        assert_eq!(layout.entry_point, 0x400500);
        assert_eq!(layout.text.vaddr, 0x400000);
        assert_eq!(layout.text.offset, core.offset_of(0x400000).unwrap());
        // Data covers the file-backed part; bss follows it:
        assert_eq!(layout.data.size, 0x800);
        assert_eq!(layout.bss.vaddr, 0x600800);
        assert_eq!(layout.bss.size, 0x100);
        assert_eq!(layout.bss.offset, layout.data.offset + 0x800);
        assert!(layout.interp.is_some());
        assert!(layout.eh_frame_hdr.is_some());
        assert_eq!(layout.dynamic.unwrap().vaddr, 0x600e00);
        assert_eq!(layout.dyn_info.dynsym.unwrap().vaddr, 0x400300);
        assert_eq!(layout.dyn_info.strsz, 0x40);
    }

    #[test]
    fn test_resolve_layout_pie_static_rebases_from_nt_file() {
        let exe = ExeImage::parse(&build_test_exe(&ExeFixture::pie_static())).unwrap();
        // The fixture NT_FILE maps the executable at 0x400000:
        let state = ProcessState::from_note_bytes(&build_test_note_segment(&[7])).unwrap();

        let fixture = CoreFixture::new(&[7])
            .with_load(TestSegment::new(0x400000, 0x1000, 0x1000))
            .with_load(TestSegment::new(0x402000, 0x1000, 0x1000))
            .write_to_temp_file();
        let core = CoreImage::open(fixture.path()).unwrap();

        let layout = resolve_layout(&exe, &state, &core, "fixture").unwrap();

        assert!(layout.pie);
        assert!(layout.static_linked);
        assert_eq!(layout.reloc_base, 0x400000);
        assert_eq!(layout.entry_point, 0x400500);
        assert_eq!(layout.text.vaddr, 0x400000);
        assert_eq!(layout.data.vaddr, 0x402000);
        assert_eq!(layout.bss.vaddr, 0x402800);
        assert!(layout.interp.is_none());
        assert!(layout.dynamic.is_none());
        // Stripped static binary: eh_frame is unrecoverable and omitted.
        assert!(layout.eh_frame.is_none());
    }

    #[test]
    fn test_resolve_layout_requires_nt_file_match_for_pie() {
        let exe = ExeImage::parse(&build_test_exe(&ExeFixture::pie_static())).unwrap();
        let state = ProcessState::from_note_bytes(&build_test_note_segment(&[7])).unwrap();

        let fixture = CoreFixture::new(&[7])
            .with_load(TestSegment::new(0x400000, 0x1000, 0x1000))
            .write_to_temp_file();
        let core = CoreImage::open(fixture.path()).unwrap();

        assert!(resolve_layout(&exe, &state, &core, "other-name").is_err());
    }
}
