use std::io::Write;
use std::mem::size_of;
use std::path::Path;

use scroll::Pwrite;
use tempfile::NamedTempFile;

use crate::cli::core_handler::core_elf_note::{
    build_elf_note, ProcessInfoNote, ProcessStatusNote, SignalInfoNote, NT_PRPSINFO, NT_SIGINFO,
};
use crate::cli::core_handler::core_elf_note::NT_AUXV;
use crate::cli::core_handler::elf;
use crate::cli::core_handler::process_state::ProcessState;
use crate::cli::core_handler::ElfPtrSize;
use crate::util::mem::AsBytes;
use goblin::elf::note::{NT_FILE, NT_PRSTATUS};

use elf::header::{Header, SIZEOF_EHDR};
use elf::program_header::{ProgramHeader, SIZEOF_PHDR, PT_LOAD, PT_NOTE};
use elf::section_header::{SectionHeader, SIZEOF_SHDR};
use goblin::elf::program_header::{PF_R, PF_W, PF_X};
use goblin::elf::section_header::{SHF_ALLOC, SHT_PROGBITS, SHT_STRTAB};

pub fn build_test_header() -> Header {
    let mut e_ident = [0u8; 16];
    e_ident[..elf::header::SELFMAG].copy_from_slice(elf::header::ELFMAG);
    e_ident[elf::header::EI_CLASS] = elf::header::ELFCLASS;
    e_ident[elf::header::EI_DATA] = if cfg!(target_endian = "little") {
        goblin::elf::header::ELFDATA2LSB
    } else {
        goblin::elf::header::ELFDATA2MSB
    };
    e_ident[elf::header::EI_VERSION] = elf::header::EV_CURRENT;

    Header {
        e_type: elf::header::ET_CORE,
        e_machine: goblin::elf::header::EM_X86_64,
        e_version: elf::header::EV_CURRENT as u32,
        e_phoff: SIZEOF_EHDR as ElfPtrSize,
        e_ehsize: SIZEOF_EHDR as u16,
        e_phentsize: SIZEOF_PHDR as u16,
        e_ident,
        ..Default::default()
    }
}

pub fn build_prstatus_desc(pid: u32) -> Vec<u8> {
    let mut status: ProcessStatusNote = unsafe { std::mem::zeroed() };
    status.pr_pid = pid;
    status.pr_cursig = 11;
    unsafe { status.as_bytes() }.to_vec()
}

pub fn build_file_note_desc(entries: &[(ElfPtrSize, ElfPtrSize, ElfPtrSize, &str)]) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&(entries.len() as ElfPtrSize).to_ne_bytes());
    desc.extend_from_slice(&(0x1000 as ElfPtrSize).to_ne_bytes());
    for (start, end, page_offset, _) in entries {
        desc.extend_from_slice(&start.to_ne_bytes());
        desc.extend_from_slice(&end.to_ne_bytes());
        desc.extend_from_slice(&page_offset.to_ne_bytes());
    }
    for (_, _, _, path) in entries {
        desc.extend_from_slice(str::as_bytes(path));
        desc.push(0);
    }
    desc
}

/// A full note segment for a process with the given thread ids: one prstatus
/// per thread plus prpsinfo, siginfo, auxv and an NT_FILE table mapping the
/// fixture executable at 0x400000.
pub fn build_test_note_segment(thread_pids: &[u32]) -> Vec<u8> {
    let mut segment = Vec::new();
    for pid in thread_pids {
        segment
            .extend(build_elf_note("CORE", &build_prstatus_desc(*pid), NT_PRSTATUS).unwrap());
    }

    let mut info = ProcessInfoNote::default();
    info.pr_fname[..7].copy_from_slice(b"fixture");
    info.pr_psargs[..13].copy_from_slice(b"fixture --run");
    info.pr_pid = thread_pids.first().copied().unwrap_or(1) as i32;
    info.pr_uid = 1000;
    segment.extend(build_elf_note("CORE", unsafe { info.as_bytes() }, NT_PRPSINFO).unwrap());

    let mut siginfo = SignalInfoNote::default();
    siginfo.si_signo = 11;
    segment.extend(build_elf_note("CORE", unsafe { siginfo.as_bytes() }, NT_SIGINFO).unwrap());

    let mut auxv = Vec::new();
    for value in [6 as ElfPtrSize, 4096, 0, 0] {
        auxv.extend_from_slice(&value.to_ne_bytes());
    }
    segment.extend(build_elf_note("CORE", &auxv, NT_AUXV).unwrap());

    let file_desc = build_file_note_desc(&[(0x400000, 0x401000, 0, "/usr/bin/fixture")]);
    segment.extend(build_elf_note("CORE", &file_desc, NT_FILE).unwrap());

    segment
}

pub fn make_test_process_state(thread_pids: &[u32]) -> ProcessState {
    ProcessState::from_note_bytes(&build_test_note_segment(thread_pids)).unwrap()
}

/// One PT_LOAD of a synthetic core.
pub struct TestSegment {
    pub vaddr: ElfPtrSize,
    pub filesz: usize,
    pub memsz: ElfPtrSize,
    pub flags: u32,
    pub data: Option<Vec<u8>>,
}

impl TestSegment {
    pub fn new(vaddr: ElfPtrSize, filesz: usize, memsz: ElfPtrSize) -> Self {
        Self {
            vaddr,
            filesz,
            memsz,
            flags: PF_R | PF_X,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Builder for an on-disk synthetic core: ELF header, PT_NOTE plus the given
/// PT_LOADs, segment contents laid out back to back.
pub struct CoreFixture {
    pub elf_header: Header,
    pub note: Vec<u8>,
    pub loads: Vec<TestSegment>,
}

impl CoreFixture {
    pub fn new(thread_pids: &[u32]) -> Self {
        Self {
            elf_header: build_test_header(),
            note: build_test_note_segment(thread_pids),
            loads: Vec::new(),
        }
    }

    pub fn with_load(mut self, segment: TestSegment) -> Self {
        self.loads.push(segment);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = 1 + self.loads.len();
        let mut header = self.elf_header;
        header.e_phnum = phnum as u16;
        header.e_phoff = SIZEOF_EHDR as ElfPtrSize;

        let mut program_headers = Vec::with_capacity(phnum);
        let mut cursor = SIZEOF_EHDR + phnum * SIZEOF_PHDR;

        program_headers.push(ProgramHeader {
            p_type: PT_NOTE,
            p_offset: cursor as ElfPtrSize,
            p_filesz: self.note.len() as ElfPtrSize,
            p_align: 4,
            ..Default::default()
        });
        cursor += self.note.len();

        for segment in &self.loads {
            program_headers.push(ProgramHeader {
                p_type: PT_LOAD,
                p_offset: cursor as ElfPtrSize,
                p_vaddr: segment.vaddr,
                p_filesz: segment.filesz as ElfPtrSize,
                p_memsz: segment.memsz,
                p_flags: segment.flags,
                p_align: 0x1000,
                ..Default::default()
            });
            cursor += segment.filesz;
        }

        let mut buffer = vec![0u8; cursor];
        buffer.pwrite_with(header, 0, scroll::NATIVE).unwrap();
        for (i, ph) in program_headers.iter().enumerate() {
            buffer
                .pwrite_with(*ph, SIZEOF_EHDR + i * SIZEOF_PHDR, scroll::NATIVE)
                .unwrap();
        }

        let note_offset = program_headers[0].p_offset as usize;
        buffer[note_offset..note_offset + self.note.len()].copy_from_slice(&self.note);

        for (segment, ph) in self.loads.iter().zip(&program_headers[1..]) {
            if let Some(data) = &segment.data {
                let offset = ph.p_offset as usize;
                let len = data.len().min(segment.filesz);
                buffer[offset..offset + len].copy_from_slice(&data[..len]);
            }
        }

        buffer
    }

    pub fn write_to_temp_file(self) -> CoreFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&self.build()).unwrap();
        tmp.flush().unwrap();
        CoreFile { tmp }
    }
}

/// Keeps the backing temp file alive for the duration of a test.
pub struct CoreFile {
    tmp: NamedTempFile,
}

impl CoreFile {
    pub fn path(&self) -> &Path {
        self.tmp.path()
    }
}

/// Shape of a synthetic on-disk executable.
pub struct ExeFixture {
    pub e_type: u16,
    pub entry: ElfPtrSize,
    /// (vaddr, filesz, memsz); file offset is always zero.
    pub text: (ElfPtrSize, ElfPtrSize, ElfPtrSize),
    /// (vaddr, offset, filesz, memsz).
    pub data: (ElfPtrSize, ElfPtrSize, ElfPtrSize, ElfPtrSize),
    pub interp: Option<(ElfPtrSize, ElfPtrSize)>,
    pub dynamic: Option<(ElfPtrSize, ElfPtrSize)>,
    pub eh_frame_hdr: Option<(ElfPtrSize, ElfPtrSize)>,
    pub sections: Vec<(String, ElfPtrSize, ElfPtrSize)>,
}

const EXE_IMAGE_SIZE: usize = 0x2000;
const EXE_INTERP_OFFSET: usize = 0x238;
const EXE_SHSTRTAB_OFFSET: usize = 0x1800;
const EXE_SHDR_OFFSET: usize = 0x1900;
const INTERPRETER: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

impl ExeFixture {
    pub fn non_pie_dynamic() -> Self {
        Self {
            e_type: goblin::elf::header::ET_EXEC,
            entry: 0x400500,
            text: (0x400000, 0x1000, 0x1000),
            data: (0x600000, 0x1000, 0x800, 0x900),
            interp: Some((0x400238, INTERPRETER.len() as ElfPtrSize)),
            dynamic: Some((0x600e00, 0x180)),
            eh_frame_hdr: Some((0x400700, 0x24)),
            sections: Vec::new(),
        }
    }

    pub fn pie_static() -> Self {
        Self {
            e_type: goblin::elf::header::ET_DYN,
            entry: 0x500,
            text: (0, 0x1000, 0x1000),
            data: (0x2000, 0x1000, 0x800, 0x900),
            interp: None,
            dynamic: None,
            eh_frame_hdr: None,
            sections: Vec::new(),
        }
    }
}

pub fn build_test_exe(fixture: &ExeFixture) -> Vec<u8> {
    let mut program_headers = vec![
        ProgramHeader {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: fixture.text.0,
            p_filesz: fixture.text.1,
            p_memsz: fixture.text.2,
            p_flags: PF_R | PF_X,
            p_align: 0x1000,
            ..Default::default()
        },
        ProgramHeader {
            p_type: PT_LOAD,
            p_offset: fixture.data.1,
            p_vaddr: fixture.data.0,
            p_filesz: fixture.data.2,
            p_memsz: fixture.data.3,
            p_flags: PF_R | PF_W,
            p_align: 0x1000,
            ..Default::default()
        },
    ];
    if let Some((vaddr, size)) = fixture.interp {
        program_headers.push(ProgramHeader {
            p_type: elf::program_header::PT_INTERP,
            p_offset: EXE_INTERP_OFFSET as ElfPtrSize,
            p_vaddr: vaddr,
            p_filesz: size,
            p_memsz: size,
            p_flags: PF_R,
            p_align: 1,
            ..Default::default()
        });
    }
    if let Some((vaddr, size)) = fixture.dynamic {
        program_headers.push(ProgramHeader {
            p_type: elf::program_header::PT_DYNAMIC,
            p_offset: 0x1e00,
            p_vaddr: vaddr,
            p_filesz: size,
            p_memsz: size,
            p_flags: PF_R | PF_W,
            p_align: 8,
            ..Default::default()
        });
    }
    if let Some((vaddr, size)) = fixture.eh_frame_hdr {
        program_headers.push(ProgramHeader {
            p_type: elf::program_header::PT_GNU_EH_FRAME,
            p_offset: 0x700,
            p_vaddr: vaddr,
            p_filesz: size,
            p_memsz: size,
            p_flags: PF_R,
            p_align: 4,
            ..Default::default()
        });
    }

    let mut header = build_test_header();
    header.e_type = fixture.e_type;
    header.e_entry = fixture.entry;
    header.e_phnum = program_headers.len() as u16;

    let mut buffer = vec![0u8; EXE_IMAGE_SIZE];

    if !fixture.sections.is_empty() {
        // shstrtab: NUL, the fixture names, and ".shstrtab" itself.
        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in &fixture.sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let shstrtab_name = names.len() as u32;
        names.extend_from_slice(b".shstrtab\0");

        let mut section_headers = vec![SectionHeader::default()];
        for ((_, addr, size), name_offset) in fixture.sections.iter().zip(&name_offsets) {
            section_headers.push(SectionHeader {
                sh_name: *name_offset,
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC as ElfPtrSize,
                sh_addr: *addr,
                sh_size: *size,
                sh_addralign: 1,
                ..Default::default()
            });
        }
        section_headers.push(SectionHeader {
            sh_name: shstrtab_name,
            sh_type: SHT_STRTAB,
            sh_offset: EXE_SHSTRTAB_OFFSET as ElfPtrSize,
            sh_size: names.len() as ElfPtrSize,
            sh_addralign: 1,
            ..Default::default()
        });

        header.e_shoff = EXE_SHDR_OFFSET as ElfPtrSize;
        header.e_shnum = section_headers.len() as u16;
        header.e_shstrndx = (section_headers.len() - 1) as u16;
        header.e_shentsize = SIZEOF_SHDR as u16;

        buffer[EXE_SHSTRTAB_OFFSET..EXE_SHSTRTAB_OFFSET + names.len()].copy_from_slice(&names);
        for (i, sh) in section_headers.iter().enumerate() {
            buffer
                .pwrite_with(*sh, EXE_SHDR_OFFSET + i * SIZEOF_SHDR, scroll::NATIVE)
                .unwrap();
        }
    }

    buffer.pwrite_with(header, 0, scroll::NATIVE).unwrap();
    for (i, ph) in program_headers.iter().enumerate() {
        buffer
            .pwrite_with(*ph, SIZEOF_EHDR + i * SIZEOF_PHDR, scroll::NATIVE)
            .unwrap();
    }
    if fixture.interp.is_some() {
        buffer[EXE_INTERP_OFFSET..EXE_INTERP_OFFSET + INTERPRETER.len()]
            .copy_from_slice(INTERPRETER);
    }

    buffer
}

/// Minimal but well-formed .eh_frame contents: one version-1 CIE with an
/// empty augmentation string (absolute pointer encoding) and one FDE per
/// function, closed by a zero terminator.
pub fn build_test_eh_frame(functions: &[(ElfPtrSize, ElfPtrSize)]) -> Vec<u8> {
    let mut out = Vec::new();

    // CIE
    out.extend_from_slice(&12u32.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.push(1); // version
    out.push(0); // augmentation ""
    out.push(1); // code alignment factor
    out.push(0x78); // data alignment factor (-8)
    out.push(16); // return address register
    out.extend_from_slice(&[0, 0, 0]); // DW_CFA_nop padding

    let address_size = size_of::<usize>();
    for (addr, size) in functions {
        let fde_length = 4 + 2 * address_size;
        let cie_pointer = out.len() + 4;
        out.extend_from_slice(&(fde_length as u32).to_ne_bytes());
        out.extend_from_slice(&(cie_pointer as u32).to_ne_bytes());
        out.extend_from_slice(&addr.to_ne_bytes());
        out.extend_from_slice(&size.to_ne_bytes());
    }

    // Terminator
    out.extend_from_slice(&0u32.to_ne_bytes());
    out
}
