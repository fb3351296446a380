use std::cmp::min;
use std::ffi::{CStr, OsStr};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result};

use crate::cli::core_handler::arch::{ElfFpRegSet, ElfGRegSet};
use crate::cli::core_handler::ElfPtrSize;
use crate::util::math::align_up;
use crate::util::mem::AsBytes;
// The Nhdr64 struct is incorrect in goblin; the 32-bit layout is what the
// kernel writes for both classes.
use goblin::elf::note::Nhdr32 as Nhdr;
use goblin::elf::note::{NT_FILE, NT_PRSTATUS};
use log::warn;
use scroll::Pread;

pub const NT_FPREGSET: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_SIGINFO: u32 = 0x53494749;

const NOTE_NAME_CORE: &[u8] = b"CORE";
const NOTE_NAME_LINUX: &[u8] = b"LINUX";

/// Fixed size of the kernel-provided argument list in prpsinfo.
pub const ELF_PRARGSZ: usize = 80;

/// Serializes one ELF note: header, then the name and descriptor, each
/// zero-padded out to 4-byte alignment.
pub fn build_elf_note(name: &str, description: &[u8], note_type: u32) -> Result<Vec<u8>> {
    // n_namesz counts the NUL terminator; anonymous notes record zero.
    let name_size = match name.len() {
        0 => 0,
        len => len + 1,
    };
    let header = Nhdr {
        n_namesz: name_size.try_into()?,
        n_descsz: description.len().try_into()?,
        n_type: note_type,
    };

    let mut buffer = Vec::with_capacity(
        size_of::<Nhdr>() + align_up(name_size, 4) + align_up(description.len(), 4),
    );
    // SAFETY: Nhdr is three u32s, no padding.
    buffer.extend_from_slice(unsafe { header.as_bytes() });
    push_padded(&mut buffer, name.as_bytes(), align_up(name_size, 4));
    push_padded(&mut buffer, description, align_up(description.len(), 4));
    Ok(buffer)
}

fn push_padded(buffer: &mut Vec<u8>, bytes: &[u8], padded_size: usize) {
    buffer.extend_from_slice(bytes);
    buffer.resize(buffer.len() + (padded_size - bytes.len()), 0);
}

/// Casts a note descriptor to a fixed-layout kernel record, enforcing the
/// exact size the kernel writes for it.
fn cast_note_desc<T>(value: &[u8]) -> Result<&T> {
    if value.len() != size_of::<T>() {
        return Err(eyre!(
            "Unexpected note descriptor size: got {}, want {}",
            value.len(),
            size_of::<T>()
        ));
    }

    // SAFETY: T only contains scalar values, no pointers; any bit pattern is valid.
    unsafe { (value.as_ptr() as *const T).as_ref() }.ok_or(eyre!("Invalid note descriptor pointer"))
}

#[derive(Debug, PartialEq)]
/// Parsed ELF note.
///
/// Contains the deserialized ELF note description for a given note type.
/// Unknown is used when the note type is not supported or parsing failed.
pub enum ElfNote<'a> {
    /// CORE::NT_PRSTATUS, one per thread, in encounter order.
    ProcessStatus(&'a ProcessStatusNote),
    /// CORE::NT_PRPSINFO singleton.
    ProcessInfo(&'a ProcessInfoNote),
    /// CORE::NT_SIGINFO singleton.
    SignalInfo(&'a SignalInfoNote),
    /// CORE::NT_FPREGSET.
    FpRegisters(&'a ElfFpRegSet),
    /// CORE::NT_AUXV: raw auxiliary vector bytes.
    Auxv(&'a [u8]),
    /// CORE::NT_FILE: table of file-backed mappings.
    File(FileNote),
    Unknown {
        name: &'a [u8],
        note_type: u32,
        description: &'a [u8],
    },
}

impl<'a> ElfNote<'a> {
    fn try_parse(name: &'a [u8], note_type: u32, description: &'a [u8]) -> Result<Option<Self>> {
        match (name, note_type) {
            (NOTE_NAME_CORE, NT_PRSTATUS) => {
                Ok(Some(Self::ProcessStatus(cast_note_desc(description)?)))
            }
            (NOTE_NAME_CORE, NT_PRPSINFO) => {
                Ok(Some(Self::ProcessInfo(cast_note_desc(description)?)))
            }
            (NOTE_NAME_CORE | NOTE_NAME_LINUX, NT_SIGINFO) => {
                Ok(Some(Self::SignalInfo(cast_note_desc(description)?)))
            }
            (NOTE_NAME_CORE, NT_FPREGSET) => {
                Ok(Some(Self::FpRegisters(cast_note_desc(description)?)))
            }
            (NOTE_NAME_CORE, NT_AUXV) => Ok(Some(Self::Auxv(description))),
            (NOTE_NAME_CORE, NT_FILE) => Ok(Some(Self::File(description.try_into()?))),
            _ => Ok(None),
        }
    }

    fn parse(name: &'a [u8], note_type: u32, description: &'a [u8]) -> Self {
        Self::try_parse(name, note_type, description)
            .unwrap_or_else(|e| {
                warn!(
                    "Skipping ELF note name={} type={:#x}: {}",
                    String::from_utf8_lossy(name),
                    note_type,
                    e
                );
                None
            })
            .unwrap_or(Self::Unknown {
                name,
                note_type,
                description,
            })
    }
}

/// Iterator over ELF notes in a buffer, consuming it front to back.
///
/// Only the current note is deserialized at a time, so the note segment is
/// never copied wholesale.
pub struct ElfNoteIterator<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for ElfNoteIterator<'a> {
    type Item = ElfNote<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        match take_note(self.remaining) {
            Ok((note, rest)) => {
                self.remaining = rest;
                Some(note)
            }
            Err(e) => {
                warn!("Stopping note iteration: {}", e);
                self.remaining = &[];
                None
            }
        }
    }
}

/// Splits one note off the front of the buffer, returning it together with
/// everything after its padded descriptor.
fn take_note(buffer: &[u8]) -> Result<(ElfNote, &[u8])> {
    let mut offset = 0;
    let header = buffer.gread::<Nhdr>(&mut offset)?;
    let name_size = header.n_namesz as usize;
    let desc_size = header.n_descsz as usize;

    let desc_start = offset + align_up(name_size, 4);
    let note_end = desc_start + align_up(desc_size, 4);
    if note_end > buffer.len() {
        return Err(eyre!(
            "Note ({} name / {} descriptor bytes) extends past segment end",
            name_size,
            desc_size
        ));
    }

    // n_namesz counts the NUL terminator; anonymous notes record zero.
    let name = match name_size {
        0 => &[][..],
        len => &buffer[offset..offset + len - 1],
    };
    let desc = &buffer[desc_start..desc_start + desc_size];

    Ok((ElfNote::parse(name, header.n_type, desc), &buffer[note_end..]))
}

/// Helper function to iterate over ELF notes in a buffer.
pub fn iterate_elf_notes(note_buffer: &[u8]) -> ElfNoteIterator {
    ElfNoteIterator {
        remaining: note_buffer,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
/// Time value for a process.
pub struct ProcessTimeVal {
    pub tv_sec: ElfPtrSize,
    pub tv_usec: ElfPtrSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
/// Deserialized process status note.
///
/// This is the deserialized form of the NT_PRSTATUS note type.
/// Note that this structure is architecture-specific.
pub struct ProcessStatusNote {
    pub si_signo: u32,
    pub si_code: u32,
    pub si_errno: u32,
    pub pr_cursig: u16,
    pub pad0: u16,
    pub pr_sigpend: ElfPtrSize,
    pub pr_sighold: ElfPtrSize,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: ProcessTimeVal,
    pub pr_stime: ProcessTimeVal,
    pub pr_cutime: ProcessTimeVal,
    pub pr_cstime: ProcessTimeVal,
    pub pr_reg: ElfGRegSet,
    pub pr_fpvalid: u32,
    #[cfg(target_pointer_width = "64")]
    pub pad1: u32,
}

/// uid_t/gid_t as the kernel lays them out in prpsinfo: the legacy 16-bit
/// types on 32-bit targets, 32-bit elsewhere.
#[cfg(target_pointer_width = "64")]
pub type PrIdType = u32;
#[cfg(target_pointer_width = "32")]
pub type PrIdType = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
/// Deserialized process info note (NT_PRPSINFO).
pub struct ProcessInfoNote {
    pub pr_state: i8,
    pub pr_sname: i8,
    pub pr_zomb: i8,
    pub pr_nice: i8,
    pub pr_flag: ElfPtrSize,
    pub pr_uid: PrIdType,
    pub pr_gid: PrIdType,
    pub pr_pid: i32,
    pub pr_ppid: i32,
    pub pr_pgrp: i32,
    pub pr_sid: i32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; ELF_PRARGSZ],
}

impl Default for ProcessInfoNote {
    fn default() -> Self {
        // All-zero is a valid "unknown process" prpsinfo.
        unsafe { std::mem::zeroed() }
    }
}

impl ProcessInfoNote {
    /// Command basename, as the kernel recorded it.
    pub fn comm(&self) -> String {
        let end = self.pr_fname.iter().position(|b| *b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.pr_fname[..end]).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
/// Deserialized signal info note (NT_SIGINFO): a raw siginfo_t. Only the
/// leading signo/errno/code triple is interpreted; the union tail is carried
/// verbatim.
pub struct SignalInfoNote {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    pub si_fields: [u8; 116],
}

impl Default for SignalInfoNote {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// An entry in the NT_FILE mapped-file table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NtFileEntry {
    pub path: Option<PathBuf>,
    pub start_addr: ElfPtrSize,
    pub end_addr: ElfPtrSize,
    pub page_offset: ElfPtrSize,
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
/// Parsed CORE::NT_FILE note.
pub struct FileNote {
    page_size: ElfPtrSize,
    mapped_files: Vec<NtFileEntry>,
    /// The input data was incomplete, so the mapped_files list is not complete.
    incomplete: bool,
}

impl FileNote {
    pub const NT_FILE_ENTRY_SIZE: usize = size_of::<ElfPtrSize>() * 3;

    /// Parses a CORE::NT_FILE note's description data:
    ///
    ///  - count and page_size machine words,
    ///  - count (start, end, file_ofs) triples,
    ///  - count NUL-terminated paths, concatenated.
    ///
    /// A clipped note keeps whatever decoded cleanly: the string table is
    /// consumed first, then triples are paired with their path until either
    /// runs short.
    fn try_parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let count = data.gread::<ElfPtrSize>(&mut offset)? as usize;
        let page_size = data.gread::<ElfPtrSize>(&mut offset)?;

        let table_size = count.saturating_mul(Self::NT_FILE_ENTRY_SIZE);
        let string_table = &data[min(offset + table_size, data.len())..];

        // First pass: the path for each slot, None once the table runs out.
        let mut paths = Vec::with_capacity(count);
        let mut string_offset = 0;
        for _ in 0..count {
            let path = string_table
                .gread::<&CStr>(&mut string_offset)
                .ok()
                .map(|s| PathBuf::from(OsStr::from_bytes(s.to_bytes())));
            paths.push(path);
        }

        // Second pass: pair each triple with its path; stop at a clipped
        // triple.
        let mut mapped_files = Vec::with_capacity(count);
        let mut truncated = false;
        for path in paths {
            let mut read_word = || data.gread::<ElfPtrSize>(&mut offset);
            match (read_word(), read_word(), read_word()) {
                (Ok(start_addr), Ok(end_addr), Ok(page_offset)) => mapped_files.push(NtFileEntry {
                    path,
                    start_addr,
                    end_addr,
                    page_offset,
                }),
                _ => {
                    truncated = true;
                    break;
                }
            }
        }

        let incomplete = truncated || mapped_files.iter().any(|e| e.path.is_none());
        if incomplete {
            // Keep the list with what was gathered so far.
            warn!("Incomplete NT_FILE note.");
        }

        Ok(Self {
            page_size,
            incomplete,
            mapped_files,
        })
    }

    /// Re-encodes the table into the kernel's NT_FILE descriptor format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(
            2 * size_of::<ElfPtrSize>() + self.mapped_files.len() * Self::NT_FILE_ENTRY_SIZE,
        );
        let mut push = |value: ElfPtrSize| {
            buffer.extend_from_slice(&value.to_ne_bytes());
        };

        push(self.mapped_files.len() as ElfPtrSize);
        push(self.page_size);
        for entry in &self.mapped_files {
            push(entry.start_addr);
            push(entry.end_addr);
            push(entry.page_offset);
        }

        for entry in &self.mapped_files {
            if let Some(path) = &entry.path {
                buffer.extend_from_slice(path.as_os_str().as_bytes());
            }
            buffer.push(0);
        }
        buffer
    }

    pub fn iter(&self) -> impl Iterator<Item = &NtFileEntry> {
        self.mapped_files.iter()
    }

    pub fn len(&self) -> usize {
        self.mapped_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped_files.is_empty()
    }

    pub fn page_size(&self) -> ElfPtrSize {
        self.page_size
    }

    /// Looks up the entry mapped exactly at the given base address.
    pub fn find_by_base(&self, addr: ElfPtrSize) -> Option<&NtFileEntry> {
        self.mapped_files.iter().find(|e| e.start_addr == addr)
    }

    /// Looks up the lowest mapping of the file with the given basename.
    pub fn find_by_basename(&self, name: &str) -> Option<&NtFileEntry> {
        self.mapped_files
            .iter()
            .filter(|e| {
                e.path
                    .as_deref()
                    .and_then(Path::file_name)
                    .map_or(false, |f| f == OsStr::new(name))
            })
            .min_by_key(|e| e.start_addr)
    }
}

impl TryFrom<&[u8]> for FileNote {
    type Error = eyre::Error;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        Self::try_parse(value)
    }
}
