use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfs::process::{FDTarget, MMPermissions, MMapPath, MemoryMap, MemoryMaps, Process};

use crate::cli::core_handler::ElfPtrSize;

/// Upper bound on the fd-info table carried into the output.
pub const FD_MAX: usize = 256;

/// Opens /proc/<pid>/mem for reading.
pub fn proc_mem_stream(pid: i32) -> Result<File> {
    let proc_mem_stream = File::open(format!("/proc/{}/mem", pid))?;
    Ok(proc_mem_stream)
}

/// Reads memory from /proc/<pid>/mem into a buffer.
pub fn read_proc_mem<P: Read + Seek>(
    proc_mem_stream: &mut P,
    vaddr: ElfPtrSize,
    size: usize,
) -> Result<Vec<u8>> {
    // Ignore unnecessary cast here as it is needed on 32-bit systems.
    #[allow(clippy::unnecessary_cast)]
    proc_mem_stream.seek(SeekFrom::Start(vaddr as u64))?;
    let mut buf = vec![0; size];
    proc_mem_stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a virtual-address range out of the target, holding it stopped for
/// the duration of the read. Segment images can be hundreds of megabytes; the
/// buffer is allocated up front in one piece.
pub fn read_process_memory(pid: i32, vaddr: ElfPtrSize, size: usize) -> Result<Vec<u8>> {
    let _stopped = StopGuard::stop(pid)?;
    let mut stream = proc_mem_stream(pid)?;
    read_proc_mem(&mut stream, vaddr, size)
}

/// Holds the target process stopped; sends SIGCONT when dropped so the
/// process is resumed on every exit path.
struct StopGuard {
    pid: Pid,
}

impl StopGuard {
    fn stop(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        kill(pid, Signal::SIGSTOP)?;
        Ok(Self { pid })
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Err(e) = kill(self.pid, Signal::SIGCONT) {
            warn!("Failed to resume pid {}: {}", self.pid, e);
        }
    }
}

/// Wrapper trait for reading /proc/<pid>/maps.
///
/// Provides a useful abstraction that can be mocked out for testing.
pub trait ProcMaps {
    fn get_process_maps(&mut self) -> Result<Vec<MemoryMap>>;
}

/// Direct implementation of ProcMaps that reads from the /proc/<pid>/maps file.
#[derive(Debug)]
pub struct ProcMapsImpl {
    pid: i32,
}

impl ProcMapsImpl {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }
}

impl ProcMaps for ProcMapsImpl {
    fn get_process_maps(&mut self) -> Result<Vec<MemoryMap>> {
        let maps_file_name = format!("/proc/{}/maps", self.pid);

        Ok(MemoryMaps::from_path(&maps_file_name)
            .map_err(|e| eyre!("Failed to read {}: {}", maps_file_name, e))?
            .memory_maps)
    }
}

/// Region classification. Exactly one kind wins per region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Heap,
    Stack,
    ThreadStack(i32),
    Vdso,
    Vsyscall,
    SharedObject,
    ExecutableFile,
    FileMapping,
    AnonymousExec,
    Padding,
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: ElfPtrSize,
    pub end: ElfPtrSize,
    pub perms: MMPermissions,
    pub kind: MappingKind,
    pub path: Option<PathBuf>,
}

impl Mapping {
    pub fn size(&self) -> ElfPtrSize {
        self.end - self.start
    }
}

/// Classifies every region of /proc/<pid>/maps.
pub fn classify_mappings(maps: &[MemoryMap]) -> Vec<Mapping> {
    maps.iter().map(classify_mapping).collect()
}

fn classify_mapping(map: &MemoryMap) -> Mapping {
    let perms = map.perms;
    let accessible =
        perms.intersects(MMPermissions::READ | MMPermissions::WRITE | MMPermissions::EXECUTE);
    let executable = perms.contains(MMPermissions::EXECUTE);

    let (kind, path) = if !accessible {
        // ---p guard regions, regardless of what backs them.
        (MappingKind::Padding, pathname_of(&map.pathname))
    } else {
        match &map.pathname {
            MMapPath::Heap => (MappingKind::Heap, None),
            MMapPath::Stack => (MappingKind::Stack, None),
            MMapPath::TStack(tid) => (MappingKind::ThreadStack(*tid as i32), None),
            MMapPath::Vdso => (MappingKind::Vdso, None),
            MMapPath::Vsyscall => (MappingKind::Vsyscall, None),
            MMapPath::Path(path) => {
                let kind = if is_shared_object_path(path) {
                    MappingKind::SharedObject
                } else if executable {
                    MappingKind::ExecutableFile
                } else {
                    MappingKind::FileMapping
                };
                (kind, Some(path.clone()))
            }
            MMapPath::Anonymous if executable => (MappingKind::AnonymousExec, None),
            _ => (MappingKind::Special, None),
        }
    };

    Mapping {
        start: map.address.0 as ElfPtrSize,
        end: map.address.1 as ElfPtrSize,
        perms,
        kind,
        path,
    }
}

fn pathname_of(pathname: &MMapPath) -> Option<PathBuf> {
    match pathname {
        MMapPath::Path(path) => Some(path.clone()),
        _ => None,
    }
}

fn is_shared_object_path(path: &Path) -> bool {
    match path.file_name().and_then(|f| f.to_str()) {
        Some(name) => name.ends_with(".so") || name.contains(".so."),
        None => false,
    }
}

/// The path of the running executable. The /proc exe link can itself point at
/// another symbolic link (overlayfs, wrapper installs), so the link target is
/// resolved one more time.
pub fn resolve_exe_path(pid: i32) -> Result<PathBuf> {
    let exe = Process::new(pid)?.exe()?;
    Ok(fs::read_link(&exe).unwrap_or(exe))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SocketProtocol {
    None = 0,
    Tcp = 1,
    Udp = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuple {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: SocketProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    pub fd: i32,
    pub path: String,
    pub socket: Option<SocketTuple>,
}

/// Reads the target's fd table. Socket fds are resolved against the TCP and
/// then the UDP table of /proc/net; the first table containing the inode sets
/// the protocol.
pub fn read_fd_table(pid: i32) -> Result<Vec<FdEntry>> {
    let process = Process::new(pid)?;
    let sockets = SocketTables::load();

    let mut entries = Vec::new();
    for fd_info in process.fd()? {
        let fd_info = match fd_info {
            Ok(fd_info) => fd_info,
            Err(e) => {
                warn!("Skipping unreadable fd entry: {}", e);
                continue;
            }
        };
        if entries.len() >= FD_MAX {
            warn!("fd table truncated at {} entries", FD_MAX);
            break;
        }

        let (path, socket) = match fd_info.target {
            FDTarget::Path(path) => (path.display().to_string(), None),
            FDTarget::Socket(inode) => {
                (format!("socket:[{}]", inode), sockets.lookup(inode))
            }
            FDTarget::Pipe(inode) => (format!("pipe:[{}]", inode), None),
            FDTarget::Net(inode) => (format!("net:[{}]", inode), None),
            FDTarget::AnonInode(kind) => (format!("anon_inode:{}", kind), None),
            FDTarget::MemFD(name) => (format!("memfd:{}", name), None),
            FDTarget::Other(kind, inode) => (format!("{}:[{}]", kind, inode), None),
        };
        entries.push(FdEntry {
            fd: fd_info.fd,
            path,
            socket,
        });
    }

    Ok(entries)
}

/// Socket inode tables from /proc/net, loaded once per invocation.
struct SocketTables {
    tcp: Vec<(u64, SocketAddr, SocketAddr)>,
    udp: Vec<(u64, SocketAddr, SocketAddr)>,
}

impl SocketTables {
    fn load() -> Self {
        let mut tcp: Vec<(u64, SocketAddr, SocketAddr)> = Vec::new();
        let mut udp: Vec<(u64, SocketAddr, SocketAddr)> = Vec::new();

        match procfs::net::tcp() {
            Ok(entries) => {
                tcp.extend(entries.into_iter().map(|e| (e.inode, e.local_address, e.remote_address)))
            }
            Err(e) => debug!("Failed to read /proc/net/tcp: {}", e),
        }
        if let Ok(entries) = procfs::net::tcp6() {
            tcp.extend(entries.into_iter().map(|e| (e.inode, e.local_address, e.remote_address)));
        }
        match procfs::net::udp() {
            Ok(entries) => {
                udp.extend(entries.into_iter().map(|e| (e.inode, e.local_address, e.remote_address)))
            }
            Err(e) => debug!("Failed to read /proc/net/udp: {}", e),
        }
        if let Ok(entries) = procfs::net::udp6() {
            udp.extend(entries.into_iter().map(|e| (e.inode, e.local_address, e.remote_address)));
        }

        Self { tcp, udp }
    }

    fn lookup(&self, inode: u64) -> Option<SocketTuple> {
        let tcp = self
            .tcp
            .iter()
            .find(|(i, _, _)| *i == inode)
            .map(|(_, local, remote)| make_socket_tuple(*local, *remote, SocketProtocol::Tcp));
        tcp.or_else(|| {
            self.udp
                .iter()
                .find(|(i, _, _)| *i == inode)
                .map(|(_, local, remote)| make_socket_tuple(*local, *remote, SocketProtocol::Udp))
        })
    }
}

fn make_socket_tuple(
    local: SocketAddr,
    remote: SocketAddr,
    protocol: SocketProtocol,
) -> SocketTuple {
    SocketTuple {
        src_addr: ipv4_bits(&local),
        dst_addr: ipv4_bits(&remote),
        src_port: local.port(),
        dst_port: remote.port(),
        protocol,
    }
}

// IPv6 endpoints keep the protocol but record zero addresses; the record
// format carries IPv4 addresses only.
fn ipv4_bits(addr: &SocketAddr) -> u32 {
    match addr {
        SocketAddr::V4(v4) => u32::from(*v4.ip()),
        SocketAddr::V6(_) => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn make_map(
        start: u64,
        end: u64,
        perms: MMPermissions,
        pathname: MMapPath,
    ) -> MemoryMap {
        MemoryMap {
            address: (start, end),
            perms,
            offset: 0,
            dev: (0, 0),
            inode: 0,
            pathname,
            extension: Default::default(),
        }
    }

    fn rx() -> MMPermissions {
        MMPermissions::READ | MMPermissions::EXECUTE | MMPermissions::PRIVATE
    }
    fn rw() -> MMPermissions {
        MMPermissions::READ | MMPermissions::WRITE | MMPermissions::PRIVATE
    }
    fn r() -> MMPermissions {
        MMPermissions::READ | MMPermissions::PRIVATE
    }

    #[rstest]
    #[case(rw(), MMapPath::Heap, MappingKind::Heap)]
    #[case(rw(), MMapPath::Stack, MappingKind::Stack)]
    #[case(rw(), MMapPath::TStack(1234), MappingKind::ThreadStack(1234))]
    #[case(rx(), MMapPath::Vdso, MappingKind::Vdso)]
    #[case(rx(), MMapPath::Vsyscall, MappingKind::Vsyscall)]
    #[case(rx(), MMapPath::Path("/usr/lib/libc.so.6".into()), MappingKind::SharedObject)]
    #[case(r(), MMapPath::Path("/usr/lib/libm.so".into()), MappingKind::SharedObject)]
    #[case(rx(), MMapPath::Path("/usr/bin/hello".into()), MappingKind::ExecutableFile)]
    #[case(r(), MMapPath::Path("/usr/bin/hello".into()), MappingKind::FileMapping)]
    #[case(rx(), MMapPath::Anonymous, MappingKind::AnonymousExec)]
    #[case(rw(), MMapPath::Anonymous, MappingKind::Special)]
    #[case(MMPermissions::PRIVATE, MMapPath::Path("/usr/lib/libc.so.6".into()), MappingKind::Padding)]
    #[case(MMPermissions::PRIVATE, MMapPath::Anonymous, MappingKind::Padding)]
    fn test_classify_mapping(
        #[case] perms: MMPermissions,
        #[case] pathname: MMapPath,
        #[case] expected: MappingKind,
    ) {
        let map = make_map(0x1000, 0x2000, perms, pathname);
        let mapping = classify_mapping(&map);
        assert_eq!(mapping.kind, expected);
        assert_eq!(mapping.start, 0x1000);
        assert_eq!(mapping.end, 0x2000);
    }

    #[test]
    fn test_classification_is_per_region_not_per_tid() {
        // Two thread stacks whose TIDs are far larger than the region count
        // must still classify in place:
        let maps = vec![
            make_map(0x1000, 0x2000, rw(), MMapPath::TStack(5555)),
            make_map(0x3000, 0x4000, rw(), MMapPath::TStack(5556)),
        ];
        let classified = classify_mappings(&maps);
        assert_eq!(classified[0].kind, MappingKind::ThreadStack(5555));
        assert_eq!(classified[1].kind, MappingKind::ThreadStack(5556));
    }

    #[rstest]
    #[case("/usr/lib/libc.so.6", true)]
    #[case("/usr/lib/libfoo.so", true)]
    #[case("/usr/bin/hello", false)]
    #[case("/tmp/data.sock", false)]
    fn test_is_shared_object_path(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_shared_object_path(Path::new(path)), expected);
    }

    #[test]
    fn test_ipv4_bits() {
        let v4: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let v6: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(ipv4_bits(&v4), 0x7f000001);
        assert_eq!(ipv4_bits(&v6), 0);
        assert_eq!(v4.port(), 8080);
    }
}
