use std::io::{Seek, SeekFrom, Write};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use eyre::Result;
use scroll::IOwrite;

use crate::cli::core_handler::core_elf_note::ELF_PRARGSZ;
use crate::cli::core_handler::process_state::ProcessState;
use crate::cli::core_handler::procfs::{FdEntry, SocketProtocol};
use crate::util::mem::AsBytes;

/// Personality bits summarizing the analyzed binary.
pub const PERSONALITY_STATIC: u32 = 1;
pub const PERSONALITY_PIE: u32 = 2;
pub const PERSONALITY_HEURISTICS: u32 = 4;
pub const PERSONALITY_STRIPPED_SHDRS: u32 = 8;

pub const FD_PATH_MAX: usize = 256;

/// Fixed-layout fd record, one per open descriptor. Socket-less fds carry a
/// zeroed tuple with protocol 0.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FdRecord {
    pub fd: i32,
    pub path: [u8; FD_PATH_MAX],
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u32,
}

pub const SIZEOF_FD_RECORD: usize = size_of::<FdRecord>();

impl From<&FdEntry> for FdRecord {
    fn from(entry: &FdEntry) -> Self {
        let mut path = [0u8; FD_PATH_MAX];
        let bytes = entry.path.as_bytes();
        let len = bytes.len().min(FD_PATH_MAX - 1);
        path[..len].copy_from_slice(&bytes[..len]);

        let (src_addr, dst_addr, src_port, dst_port, protocol) = match &entry.socket {
            Some(socket) => (
                socket.src_addr,
                socket.dst_addr,
                socket.src_port,
                socket.dst_port,
                socket.protocol as u32,
            ),
            None => (0, 0, 0, 0, SocketProtocol::None as u32),
        };

        Self {
            fd: entry.fd,
            path,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
        }
    }
}

/// Start offsets of everything appended past the original core content. The
/// final field is where the section header table will go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOffsets {
    pub prstatus_offset: u64,
    pub prstatus_count: usize,
    pub fdinfo_offset: u64,
    pub fdinfo_count: usize,
    pub siginfo_offset: u64,
    pub auxv_offset: u64,
    pub auxv_size: usize,
    pub exepath_offset: u64,
    pub exepath_size: usize,
    pub personality_offset: u64,
    pub arglist_offset: u64,
    pub section_table_offset: u64,
}

/// Appends the auxiliary payloads to the end of the reconstructed core, in
/// their fixed order, recording where each landed.
pub fn append_payloads<W: Write + Seek>(
    output: &mut W,
    state: &ProcessState,
    exe_path: &Path,
    fds: &[FdEntry],
    personality: u32,
) -> Result<PayloadOffsets> {
    let mut offsets = PayloadOffsets {
        prstatus_offset: output.seek(SeekFrom::End(0))?,
        prstatus_count: state.thread_count(),
        ..Default::default()
    };

    // Thread 0 is the group leader; the notes already carry them in order.
    for thread in &state.threads {
        output.write_all(unsafe { thread.as_bytes() })?;
    }

    offsets.fdinfo_offset = output.stream_position()?;
    offsets.fdinfo_count = fds.len();
    for fd in fds {
        let record = FdRecord::from(fd);
        output.write_all(unsafe { record.as_bytes() })?;
    }

    offsets.siginfo_offset = output.stream_position()?;
    output.write_all(unsafe { state.signal_info.as_bytes() })?;

    offsets.auxv_offset = output.stream_position()?;
    offsets.auxv_size = state.auxv.len();
    output.write_all(&state.auxv)?;

    offsets.exepath_offset = output.stream_position()?;
    let path_bytes = exe_path.as_os_str().as_bytes();
    output.write_all(path_bytes)?;
    output.write_all(&[0])?;
    offsets.exepath_size = path_bytes.len() + 1;

    offsets.personality_offset = output.stream_position()?;
    output.iowrite::<u32>(personality)?;

    offsets.arglist_offset = output.stream_position()?;
    let arg_list: [u8; ELF_PRARGSZ] = state.arg_list();
    output.write_all(&arg_list)?;

    offsets.section_table_offset = output.stream_position()?;
    Ok(offsets)
}
