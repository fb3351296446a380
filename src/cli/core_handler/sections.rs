use std::io::{Seek, SeekFrom, Write};
use std::mem::size_of;

use eyre::Result;
use log::{debug, warn};
use scroll::Pwrite;

use crate::cli::core_handler::core_elf_note::{ProcessStatusNote, SignalInfoNote, ELF_PRARGSZ};
use crate::cli::core_handler::core_image::CoreImage;
use crate::cli::core_handler::elf;
use crate::cli::core_handler::layout::{LayoutEntry, LayoutOverrides, LayoutTable};
use crate::cli::core_handler::libraries::LibraryRecord;
use crate::cli::core_handler::payloads::{PayloadOffsets, SIZEOF_FD_RECORD};
use crate::cli::core_handler::procfs::{Mapping, MappingKind};
use crate::cli::core_handler::ElfPtrSize;
use crate::util::math::align_up;

use elf::header::{Header, ET_NONE, SIZEOF_EHDR};
use elf::section_header::{SectionHeader, SIZEOF_SHDR};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM, SHT_GNU_HASH, SHT_NOBITS,
    SHT_NOTE, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_SHLIB, SHT_STRTAB, SHT_SYMTAB,
};

/// Section type for shared-object regions flagged as injected by the
/// heuristics pass. Lives in the user range so stock tooling passes it
/// through untouched.
pub const SHT_INJECTED: u32 = 0x8000_0001;

const PLT_ALIGNMENT: usize = 16;

/// Everything the symbol reconstructor needs to patch the table the
/// synthesizer wrote.
#[derive(Debug, Clone, Copy)]
pub struct SectionPlan {
    pub e_shoff: u64,
    pub section_count: usize,
    pub text_index: usize,
    pub symtab_index: usize,
    pub strtab_index: usize,
    pub got_plt_index: Option<usize>,
    pub dynsym_size: ElfPtrSize,
    /// eh_frame range adjusted for the leading-zeroes workaround, for the
    /// FDE walker.
    pub eh_frame: Option<LayoutEntry>,
    pub eh_frame_workaround: bool,
}

/// Accumulates section headers and their name string table.
struct SectionBuilder {
    headers: Vec<SectionHeader>,
    names: Vec<u8>,
}

impl SectionBuilder {
    fn new() -> Self {
        Self {
            headers: vec![SectionHeader::default()],
            names: vec![0],
        }
    }

    fn add(&mut self, name: &str, mut header: SectionHeader) -> usize {
        header.sh_name = self.intern(name);
        self.headers.push(header);
        self.headers.len() - 1
    }

    fn intern(&mut self, name: &str) -> u32 {
        let offset = self.names.len() as u32;
        self.names.extend_from_slice(name.as_bytes());
        self.names.push(0);
        offset
    }
}

/// Emits the section header table and shstrtab at the section table base and
/// patches the ELF header so section-aware tooling picks them up.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_sections<W: Write + Seek>(
    output: &mut W,
    core: &CoreImage,
    layout: &LayoutTable,
    overrides: &LayoutOverrides,
    payloads: &PayloadOffsets,
    libraries: &[LibraryRecord],
    maps: &[Mapping],
) -> Result<SectionPlan> {
    let ptr_size = size_of::<ElfPtrSize>() as ElfPtrSize;
    let dynamic = !layout.static_linked;
    let mut builder = SectionBuilder::new();

    // Link fields that point at sections not yet emitted are fixed up after
    // the full table is built.
    let mut dynsym_index = None;
    let mut dynstr_index = None;
    let mut links_to_dynsym = Vec::new();

    if dynamic {
        if let Some(interp) = &layout.interp {
            builder.add(
                ".interp",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: interp.vaddr,
                    sh_offset: interp.offset,
                    sh_size: interp.size,
                    sh_addralign: 1,
                    ..Default::default()
                },
            );
        }
    }

    builder.add(
        ".note",
        SectionHeader {
            sh_type: SHT_NOTE,
            sh_flags: SHF_ALLOC as ElfPtrSize,
            sh_addr: layout.note.vaddr,
            sh_offset: layout.note.offset,
            sh_size: layout.note.size,
            sh_addralign: 4,
            ..Default::default()
        },
    );

    let mut dynsym_size = 0;
    if dynamic {
        if let Some(hash) = &layout.dyn_info.hash {
            let index = builder.add(
                ".hash",
                SectionHeader {
                    sh_type: SHT_GNU_HASH,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: hash.vaddr,
                    sh_offset: hash.offset,
                    sh_size: overrides.hash_size,
                    sh_addralign: ptr_size,
                    ..Default::default()
                },
            );
            links_to_dynsym.push(index);
        }

        if let (Some(dynsym), Some(dynstr)) = (&layout.dyn_info.dynsym, &layout.dyn_info.dynstr) {
            // .dynstr follows .dynsym in every linker layout; the distance is
            // the symbol table size.
            dynsym_size = if dynstr.vaddr > dynsym.vaddr {
                dynstr.vaddr - dynsym.vaddr
            } else {
                crate::cli::core_handler::layout::FALLBACK_SECTION_SIZE
            };
            dynsym_index = Some(builder.add(
                ".dynsym",
                SectionHeader {
                    sh_type: SHT_DYNSYM,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: dynsym.vaddr,
                    sh_offset: dynsym.offset,
                    sh_size: dynsym_size,
                    sh_entsize: elf::sym::SIZEOF_SYM as ElfPtrSize,
                    sh_addralign: ptr_size,
                    sh_info: 1,
                    ..Default::default()
                },
            ));

            let strsz = layout.dyn_info.strsz;
            dynstr_index = Some(builder.add(
                ".dynstr",
                SectionHeader {
                    sh_type: SHT_STRTAB,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: dynstr.vaddr,
                    sh_offset: dynstr.offset,
                    sh_size: strsz,
                    sh_addralign: 1,
                    ..Default::default()
                },
            ));
        }

        if let Some(rel) = &layout.dyn_info.rel {
            let (name, sh_type, entsize) = if layout.dyn_info.rel_is_rela {
                (".rela.dyn", SHT_RELA, elf::reloc::SIZEOF_RELA)
            } else {
                (".rel.dyn", SHT_REL, elf::reloc::SIZEOF_REL)
            };
            let index = builder.add(
                name,
                SectionHeader {
                    sh_type,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: rel.vaddr,
                    sh_offset: rel.offset,
                    sh_size: overrides.rel_dyn_size,
                    sh_entsize: entsize as ElfPtrSize,
                    sh_addralign: ptr_size,
                    ..Default::default()
                },
            );
            links_to_dynsym.push(index);
        }

        if let Some(jmprel) = &layout.dyn_info.jmprel {
            let (name, sh_type, entsize) = if layout.dyn_info.plt_uses_rela {
                (".rela.plt", SHT_RELA, elf::reloc::SIZEOF_RELA)
            } else {
                (".rel.plt", SHT_REL, elf::reloc::SIZEOF_REL)
            };
            let index = builder.add(
                name,
                SectionHeader {
                    sh_type,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: jmprel.vaddr,
                    sh_offset: jmprel.offset,
                    sh_size: overrides.rel_plt_size,
                    sh_entsize: entsize as ElfPtrSize,
                    sh_addralign: ptr_size,
                    ..Default::default()
                },
            );
            links_to_dynsym.push(index);
        }

        if let Some(init) = &layout.dyn_info.init {
            builder.add(
                ".init",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as ElfPtrSize,
                    sh_addr: init.vaddr,
                    sh_offset: init.offset,
                    sh_size: overrides.init_size,
                    sh_addralign: 4,
                    ..Default::default()
                },
            );
        }

        // .plt sits right after .init, 16-byte aligned, unless the original
        // executable's section headers say otherwise.
        let plt = match (overrides.plt_vaddr, &layout.dyn_info.init) {
            (Some(vaddr), _) => core.offset_of(vaddr).map(|offset| (vaddr, offset)),
            (None, Some(init)) => {
                let vaddr =
                    align_up((init.vaddr + overrides.init_size) as usize, PLT_ALIGNMENT)
                        as ElfPtrSize;
                let offset =
                    align_up((init.offset + overrides.init_size) as usize, PLT_ALIGNMENT)
                        as ElfPtrSize;
                Some((vaddr, offset))
            }
            (None, None) => None,
        };
        if let Some((vaddr, offset)) = plt {
            builder.add(
                ".plt",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as ElfPtrSize,
                    sh_addr: vaddr,
                    sh_offset: offset,
                    sh_size: overrides.plt_size,
                    sh_entsize: PLT_ALIGNMENT as ElfPtrSize,
                    sh_addralign: PLT_ALIGNMENT as ElfPtrSize,
                    ..Default::default()
                },
            );
        }
    }

    let text_index = builder.add(
        ".text",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as ElfPtrSize,
            sh_addr: layout.text.vaddr,
            sh_offset: layout.text.offset,
            sh_size: layout.text.size,
            sh_addralign: 16,
            ..Default::default()
        },
    );

    if dynamic {
        if let Some(fini) = &layout.dyn_info.fini {
            builder.add(
                ".fini",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as ElfPtrSize,
                    sh_addr: fini.vaddr,
                    sh_offset: fini.offset,
                    sh_size: overrides.fini_size,
                    sh_addralign: 4,
                    ..Default::default()
                },
            );
        }

        if let Some(eh_frame_hdr) = &layout.eh_frame_hdr {
            builder.add(
                ".eh_frame_hdr",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: SHF_ALLOC as ElfPtrSize,
                    sh_addr: eh_frame_hdr.vaddr,
                    sh_offset: eh_frame_hdr.offset,
                    sh_size: eh_frame_hdr.size,
                    sh_addralign: 4,
                    ..Default::default()
                },
            );
        }
    }

    // Some cores carry four zero bytes ahead of the first CIE; the section
    // must start past them or unwinders reject the whole table.
    let mut eh_frame_workaround = false;
    let eh_frame = layout.eh_frame.map(|entry| {
        let leading = core
            .data()
            .get(entry.offset as usize..entry.offset as usize + 4);
        if leading == Some(&[0, 0, 0, 0]) {
            debug!("eh_frame starts with zero bytes; skipping them");
            eh_frame_workaround = true;
            LayoutEntry::new(entry.vaddr + 4, entry.offset + 4, entry.size)
        } else {
            entry
        }
    });
    if let Some(eh_frame) = &eh_frame {
        builder.add(
            ".eh_frame",
            SectionHeader {
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC as ElfPtrSize,
                sh_addr: eh_frame.vaddr,
                sh_offset: eh_frame.offset,
                sh_size: eh_frame.size,
                sh_addralign: 8,
                ..Default::default()
            },
        );
    }

    let mut got_plt_index = None;
    if dynamic {
        if let Some(dyn_entry) = &layout.dynamic {
            let index = builder.add(
                ".dynamic",
                SectionHeader {
                    sh_type: SHT_DYNAMIC,
                    sh_flags: (SHF_ALLOC | SHF_WRITE) as ElfPtrSize,
                    sh_addr: dyn_entry.vaddr,
                    sh_offset: dyn_entry.offset,
                    sh_size: dyn_entry.size,
                    sh_entsize: elf::dynamic::SIZEOF_DYN as ElfPtrSize,
                    sh_addralign: ptr_size,
                    ..Default::default()
                },
            );
            if let Some(dynstr_index) = dynstr_index {
                builder.headers[index].sh_link = dynstr_index as u32;
            }
        }

        if let Some(pltgot) = &layout.dyn_info.pltgot {
            got_plt_index = Some(builder.add(
                ".got.plt",
                SectionHeader {
                    sh_type: SHT_PROGBITS,
                    sh_flags: (SHF_ALLOC | SHF_WRITE) as ElfPtrSize,
                    sh_addr: pltgot.vaddr,
                    sh_offset: pltgot.offset,
                    sh_size: overrides.got_plt_size,
                    sh_entsize: ptr_size,
                    sh_addralign: ptr_size,
                    ..Default::default()
                },
            ));
        }
    }

    builder.add(
        ".data",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | SHF_WRITE) as ElfPtrSize,
            sh_addr: layout.data.vaddr,
            sh_offset: layout.data.offset,
            sh_size: layout.data.size,
            sh_addralign: ptr_size,
            ..Default::default()
        },
    );
    builder.add(
        ".bss",
        SectionHeader {
            sh_type: SHT_NOBITS,
            sh_flags: (SHF_ALLOC | SHF_WRITE) as ElfPtrSize,
            sh_addr: layout.bss.vaddr,
            sh_offset: layout.bss.offset,
            sh_size: layout.bss.size,
            sh_addralign: ptr_size,
            ..Default::default()
        },
    );

    add_mapped_region(&mut builder, core, maps, MappingKind::Heap, ".heap", SHF_WRITE);

    add_library_sections(&mut builder, libraries, ptr_size);

    builder.add(
        ".prstatus",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_offset: payloads.prstatus_offset as ElfPtrSize,
            sh_size: (payloads.prstatus_count * size_of::<ProcessStatusNote>()) as ElfPtrSize,
            sh_entsize: size_of::<ProcessStatusNote>() as ElfPtrSize,
            sh_addralign: ptr_size,
            ..Default::default()
        },
    );
    builder.add(
        ".fdinfo",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_offset: payloads.fdinfo_offset as ElfPtrSize,
            sh_size: (payloads.fdinfo_count * SIZEOF_FD_RECORD) as ElfPtrSize,
            sh_entsize: SIZEOF_FD_RECORD as ElfPtrSize,
            sh_addralign: 4,
            ..Default::default()
        },
    );
    builder.add(
        ".siginfo",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_offset: payloads.siginfo_offset as ElfPtrSize,
            sh_size: size_of::<SignalInfoNote>() as ElfPtrSize,
            sh_entsize: size_of::<SignalInfoNote>() as ElfPtrSize,
            sh_addralign: 4,
            ..Default::default()
        },
    );
    builder.add(
        ".auxvector",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_offset: payloads.auxv_offset as ElfPtrSize,
            sh_size: payloads.auxv_size as ElfPtrSize,
            sh_entsize: 2 * ptr_size,
            sh_addralign: ptr_size,
            ..Default::default()
        },
    );
    builder.add(
        ".exepath",
        SectionHeader {
            sh_type: SHT_STRTAB,
            sh_offset: payloads.exepath_offset as ElfPtrSize,
            sh_size: payloads.exepath_size as ElfPtrSize,
            sh_addralign: 1,
            ..Default::default()
        },
    );
    builder.add(
        ".personality",
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_offset: payloads.personality_offset as ElfPtrSize,
            sh_size: 4,
            sh_entsize: 4,
            sh_addralign: 1,
            ..Default::default()
        },
    );
    builder.add(
        ".arglist",
        SectionHeader {
            sh_type: SHT_STRTAB,
            sh_offset: payloads.arglist_offset as ElfPtrSize,
            sh_size: ELF_PRARGSZ as ElfPtrSize,
            sh_addralign: 1,
            ..Default::default()
        },
    );

    add_mapped_region(&mut builder, core, maps, MappingKind::Stack, ".stack", SHF_WRITE);
    add_mapped_region(&mut builder, core, maps, MappingKind::Vdso, ".vdso", SHF_EXECINSTR);
    add_mapped_region(
        &mut builder,
        core,
        maps,
        MappingKind::Vsyscall,
        ".vsyscall",
        SHF_EXECINSTR,
    );

    // .symtab/.strtab are placeholders; the eh_frame symbol reconstructor
    // fills in their offsets and sizes.
    let symtab_index = builder.add(
        ".symtab",
        SectionHeader {
            sh_type: SHT_SYMTAB,
            sh_entsize: elf::sym::SIZEOF_SYM as ElfPtrSize,
            sh_addralign: ptr_size,
            sh_info: 1,
            ..Default::default()
        },
    );
    let strtab_index = builder.add(
        ".strtab",
        SectionHeader {
            sh_type: SHT_STRTAB,
            sh_addralign: 1,
            ..Default::default()
        },
    );
    builder.headers[symtab_index].sh_link = strtab_index as u32;

    let shstrtab_index = builder.add(
        ".shstrtab",
        SectionHeader {
            sh_type: SHT_STRTAB,
            sh_addralign: 1,
            ..Default::default()
        },
    );

    if let Some(dynsym_index) = dynsym_index {
        for index in links_to_dynsym {
            builder.headers[index].sh_link = dynsym_index as u32;
        }
        if let Some(dynstr_index) = dynstr_index {
            builder.headers[dynsym_index].sh_link = dynstr_index as u32;
        }
    }

    // The shstrtab lands right behind the section header table.
    let e_shoff = payloads.section_table_offset;
    let section_count = builder.headers.len();
    let shstrtab_offset = e_shoff + (section_count * SIZEOF_SHDR) as u64;
    builder.headers[shstrtab_index].sh_offset = shstrtab_offset as ElfPtrSize;
    builder.headers[shstrtab_index].sh_size = builder.names.len() as ElfPtrSize;

    write_section_table(output, &builder, e_shoff)?;
    patch_elf_header(
        output,
        core,
        layout,
        e_shoff,
        section_count,
        shstrtab_index,
    )?;

    Ok(SectionPlan {
        e_shoff,
        section_count,
        text_index,
        symtab_index,
        strtab_index,
        got_plt_index,
        dynsym_size,
        eh_frame,
        eh_frame_workaround,
    })
}

fn add_mapped_region(
    builder: &mut SectionBuilder,
    core: &CoreImage,
    maps: &[Mapping],
    kind: MappingKind,
    name: &str,
    extra_flags: u32,
) {
    let mapping = match maps.iter().find(|m| m.kind == kind) {
        Some(mapping) => mapping,
        None => return,
    };
    let offset = match core.offset_of(mapping.start) {
        Some(offset) => offset,
        None => {
            warn!("{} region {:#x} not present in core", name, mapping.start);
            return;
        }
    };

    builder.add(
        name,
        SectionHeader {
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | extra_flags) as ElfPtrSize,
            sh_addr: mapping.start,
            sh_offset: offset,
            sh_size: mapping.size(),
            sh_addralign: size_of::<ElfPtrSize>() as ElfPtrSize,
            ..Default::default()
        },
    );
}

fn add_library_sections(
    builder: &mut SectionBuilder,
    libraries: &[LibraryRecord],
    ptr_size: ElfPtrSize,
) {
    let mut data_counters: Vec<(&str, usize)> = Vec::new();

    for library in libraries {
        let suffix = if library.is_executable() {
            format!("{}.text", library.name)
        } else if library.is_writable() {
            let counter = match data_counters.iter_mut().find(|(n, _)| *n == library.name) {
                Some((_, counter)) => {
                    *counter += 1;
                    *counter
                }
                None => {
                    data_counters.push((&library.name, 0));
                    0
                }
            };
            format!("{}.data.{}", library.name, counter)
        } else if library.is_readable() {
            format!("{}.relro", library.name)
        } else {
            format!("{}.undef", library.name)
        };

        let mut flags = SHF_ALLOC;
        if library.is_executable() {
            flags |= SHF_EXECINSTR;
        }
        if library.is_writable() {
            flags |= SHF_WRITE;
        }

        builder.add(
            &suffix,
            SectionHeader {
                sh_type: if library.injected {
                    SHT_INJECTED
                } else {
                    SHT_SHLIB
                },
                sh_flags: flags as ElfPtrSize,
                sh_addr: library.base,
                sh_offset: library.offset,
                sh_size: library.size,
                sh_addralign: ptr_size,
                ..Default::default()
            },
        );
    }
}

fn write_section_table<W: Write + Seek>(
    output: &mut W,
    builder: &SectionBuilder,
    e_shoff: u64,
) -> Result<()> {
    let mut table = vec![0u8; builder.headers.len() * SIZEOF_SHDR];
    for (i, header) in builder.headers.iter().enumerate() {
        table.pwrite_with(*header, i * SIZEOF_SHDR, scroll::NATIVE)?;
    }

    output.seek(SeekFrom::Start(e_shoff))?;
    output.write_all(&table)?;
    output.write_all(&builder.names)?;
    Ok(())
}

fn patch_elf_header<W: Write + Seek>(
    output: &mut W,
    core: &CoreImage,
    layout: &LayoutTable,
    e_shoff: u64,
    section_count: usize,
    shstrtab_index: usize,
) -> Result<()> {
    let mut header: Header = *core.elf_header();
    header.e_type = ET_NONE;
    header.e_entry = layout.entry_point;
    header.e_shoff = e_shoff as ElfPtrSize;
    header.e_shnum = section_count as u16;
    header.e_shstrndx = shstrtab_index as u16;
    header.e_shentsize = SIZEOF_SHDR as u16;

    let mut bytes = [0u8; SIZEOF_EHDR];
    bytes.pwrite_with(header, 0, scroll::NATIVE)?;
    output.seek(SeekFrom::Start(0))?;
    output.write_all(&bytes)?;
    Ok(())
}
