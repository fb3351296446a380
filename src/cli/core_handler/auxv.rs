use std::mem::size_of;

use scroll::Pread;

#[cfg(target_pointer_width = "64")]
pub type AuxvUint = u64;

#[cfg(target_pointer_width = "32")]
pub type AuxvUint = u32;

/// Terminates the vector.
pub const AT_NULL: AuxvUint = 0;

/// System page size: the unit in which the kernel truncates executable
/// mappings when it writes a core, so also the size of every text stub the
/// reinjector replaces.
pub const AT_PAGESZ: AuxvUint = 6;

const AUXV_ENTRY_SIZE: usize = 2 * size_of::<AuxvUint>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvEntry {
    pub key: AuxvUint,
    pub value: AuxvUint,
}

/// Walks the packed (key, value) machine-word pairs of a dumped auxiliary
/// vector. Iteration ends at the AT_NULL terminator; a truncated trailing
/// pair is dropped.
pub fn iterate_auxv(auxv: &[u8]) -> impl Iterator<Item = AuxvEntry> + '_ {
    auxv.chunks_exact(AUXV_ENTRY_SIZE)
        .filter_map(|pair| {
            let mut offset = 0;
            let key = pair.gread::<AuxvUint>(&mut offset).ok()?;
            let value = pair.gread::<AuxvUint>(&mut offset).ok()?;
            Some(AuxvEntry { key, value })
        })
        .take_while(|entry| entry.key != AT_NULL)
}

/// The page size the kernel recorded for the dumped process, if the vector
/// carries one.
pub fn find_page_size(auxv: &[u8]) -> Option<AuxvUint> {
    iterate_auxv(auxv)
        .find(|entry| entry.key == AT_PAGESZ)
        .map(|entry| entry.value)
}
