use std::fs;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use log::trace;

use crate::cli::core_handler::elf;
use crate::cli::core_handler::memory_range::Segment;
use crate::cli::core_handler::ElfPtrSize;

use elf::header::{Header, EI_CLASS, ELFCLASS, ELFMAG, ET_CORE, EV_CURRENT, SELFMAG, SIZEOF_EHDR};
use elf::program_header::{ProgramHeader, PT_LOAD, PT_NOTE, SIZEOF_PHDR};

/// The kernel-produced core file, held in memory with its header and program
/// header table indexed. After the reinjector rewrites the file on disk, the
/// stale image is discarded with [`CoreImage::reload`].
pub struct CoreImage {
    path: PathBuf,
    data: Vec<u8>,
    elf_header: Header,
    program_headers: Vec<ProgramHeader>,
    note_offset: usize,
    note_size: usize,
}

impl CoreImage {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        trace!("Loaded core file {} ({} bytes)", path.display(), data.len());
        Self::from_vec(path.to_path_buf(), data)
    }

    fn from_vec(path: PathBuf, data: Vec<u8>) -> Result<Self> {
        if data.len() < SIZEOF_EHDR {
            return Err(eyre!("Core file shorter than an ELF header"));
        }
        let header_buf: &[u8; SIZEOF_EHDR] = data[..SIZEOF_EHDR]
            .try_into()
            .map_err(|_| eyre!("Invalid ELF header"))?;
        let elf_header = *Header::from_bytes(header_buf);
        verify_core_header(&elf_header)?;

        let ph_start = elf_header.e_phoff as usize;
        let ph_size = elf_header.e_phnum as usize * SIZEOF_PHDR;
        if ph_start + ph_size > data.len() {
            return Err(eyre!("Program header table extends past end of core"));
        }
        let program_headers =
            ProgramHeader::from_bytes(&data[ph_start..ph_start + ph_size], elf_header.e_phnum as usize);

        let note = program_headers
            .iter()
            .find(|ph| ph.p_type == PT_NOTE)
            .ok_or_else(|| eyre!("Core has no PT_NOTE segment"))?;
        let note_offset = note.p_offset as usize;
        let note_size = note.p_filesz as usize;
        if note_offset + note_size > data.len() {
            return Err(eyre!("Note segment extends past end of core"));
        }

        Ok(Self {
            path,
            data,
            elf_header,
            program_headers,
            note_offset,
            note_size,
        })
    }

    /// Re-reads the file after an on-disk rewrite; the previous image and all
    /// offsets derived from it are invalidated.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn elf_header(&self) -> &Header {
        &self.elf_header
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn note_bytes(&self) -> &[u8] {
        &self.data[self.note_offset..self.note_offset + self.note_size]
    }

    pub fn note_offset(&self) -> usize {
        self.note_offset
    }

    /// The PT_LOAD whose memory image covers the given virtual address.
    pub fn load_segment_containing(&self, vaddr: ElfPtrSize) -> Option<&ProgramHeader> {
        self.program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .find(|ph| Segment::new(ph.p_vaddr, ph.p_memsz, ph.p_offset).contains(vaddr))
    }

    /// Translates a virtual address to its offset in the core file.
    pub fn offset_of(&self, vaddr: ElfPtrSize) -> Option<ElfPtrSize> {
        self.load_segment_containing(vaddr)
            .and_then(|ph| Segment::new(ph.p_vaddr, ph.p_memsz, ph.p_offset).offset_of(vaddr))
    }

    /// The file bytes of the given virtual address range, if fully present.
    pub fn bytes_at(&self, vaddr: ElfPtrSize, size: usize) -> Option<&[u8]> {
        let offset = self.offset_of(vaddr)? as usize;
        self.data.get(offset..offset + size)
    }
}

fn verify_core_header(header: &Header) -> Result<()> {
    if &header.e_ident[0..SELFMAG] != ELFMAG
        || header.e_ident[EI_CLASS] != ELFCLASS
        || header.e_version != EV_CURRENT as u32
        || header.e_ehsize != SIZEOF_EHDR as u16
        || header.e_phentsize != SIZEOF_PHDR as u16
    {
        return Err(eyre!("Invalid ELF header"));
    }
    if header.e_type != ET_CORE {
        return Err(eyre!("Not a core file (e_type={})", header.e_type));
    }
    Ok(())
}
