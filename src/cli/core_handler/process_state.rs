use eyre::{eyre, Result};
use log::warn;

use crate::cli::core_handler::arch::ElfFpRegSet;
use crate::cli::core_handler::auxv::{find_page_size, AuxvUint};
use crate::cli::core_handler::core_elf_note::{
    iterate_elf_notes, ElfNote, FileNote, ProcessInfoNote, ProcessStatusNote, SignalInfoNote,
    ELF_PRARGSZ,
};

/// Everything the note segment says about the dumped process: one prstatus
/// per thread (group leader first), the prpsinfo/siginfo singletons, the raw
/// auxiliary vector and the NT_FILE mapping table.
#[derive(Debug)]
pub struct ProcessState {
    pub threads: Vec<ProcessStatusNote>,
    pub process_info: ProcessInfoNote,
    pub signal_info: SignalInfoNote,
    pub fp_regs: Option<ElfFpRegSet>,
    pub auxv: Vec<u8>,
    pub mapped_files: FileNote,
}

impl ProcessState {
    /// Decodes the core's note segment. A core without at least one prstatus
    /// or without an NT_FILE table cannot be reconstructed; missing
    /// prpsinfo/siginfo are tolerated and zero-filled.
    pub fn from_note_bytes(note_buffer: &[u8]) -> Result<Self> {
        let mut threads = Vec::new();
        let mut process_info = None;
        let mut signal_info = None;
        let mut fp_regs = None;
        let mut auxv = Vec::new();
        let mut mapped_files = None;

        for note in iterate_elf_notes(note_buffer) {
            match note {
                ElfNote::ProcessStatus(status) => threads.push(*status),
                ElfNote::ProcessInfo(info) => {
                    if process_info.replace(*info).is_some() {
                        warn!("Duplicate NT_PRPSINFO note, keeping the last one");
                    }
                }
                ElfNote::SignalInfo(info) => {
                    if signal_info.replace(*info).is_some() {
                        warn!("Duplicate NT_SIGINFO note, keeping the last one");
                    }
                }
                // The kernel emits one fpregset per thread; only the group
                // leader's is carried.
                ElfNote::FpRegisters(regs) => {
                    if fp_regs.is_none() {
                        fp_regs = Some(*regs);
                    }
                }
                ElfNote::Auxv(data) => auxv = data.to_vec(),
                ElfNote::File(table) => mapped_files = Some(table),
                ElfNote::Unknown { .. } => {}
            }
        }

        if threads.is_empty() {
            return Err(eyre!("Core contains no NT_PRSTATUS note"));
        }
        let mapped_files =
            mapped_files.ok_or_else(|| eyre!("Core contains no NT_FILE mapping table"))?;

        let process_info = process_info.unwrap_or_else(|| {
            warn!("Core contains no NT_PRPSINFO note");
            ProcessInfoNote::default()
        });
        let signal_info = signal_info.unwrap_or_else(|| {
            warn!("Core contains no NT_SIGINFO note");
            SignalInfoNote::default()
        });

        Ok(Self {
            threads,
            process_info,
            signal_info,
            fp_regs,
            auxv,
            mapped_files,
        })
    }

    /// The thread-group leader's status record.
    pub fn prstatus(&self) -> &ProcessStatusNote {
        &self.threads[0]
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn comm(&self) -> String {
        self.process_info.comm()
    }

    /// The kernel-provided, fixed-size argument list.
    pub fn arg_list(&self) -> [u8; ELF_PRARGSZ] {
        self.process_info.pr_psargs
    }

    pub fn page_size(&self) -> Option<AuxvUint> {
        find_page_size(&self.auxv)
    }

    pub fn exit_signal(&self) -> u16 {
        self.prstatus().pr_cursig
    }
}
