mod arch;
mod auxv;
mod core_elf_note;
mod core_image;
mod func_symbols;
mod layout;
mod libraries;
mod memory_range;
mod payloads;
mod process_state;
mod procfs;
mod reinject;
mod sections;
#[cfg(test)]
mod test_utils;

use std::env::{set_var, var};
use std::ffi::CStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use argh::FromArgs;
use eyre::{eyre, Result, WrapErr};
use kernlog::KernelLog;
use log::{info, warn, LevelFilter, Log};
use prctl::set_dumpable;

use self::core_image::CoreImage;
use self::func_symbols::{reconstruct_local_symbols, EhFrameWalker};
use self::layout::{resolve_layout, ExeImage, LayoutOverrides, LayoutTable};
use self::libraries::{
    assign_core_offsets, collect_libraries, mark_injected_libraries, resolve_needed_names,
    LibraryRecord,
};
use self::payloads::{
    append_payloads, PERSONALITY_HEURISTICS, PERSONALITY_PIE, PERSONALITY_STATIC,
    PERSONALITY_STRIPPED_SHDRS,
};
use self::process_state::ProcessState;
use self::procfs::{
    classify_mappings, read_fd_table, read_process_memory, resolve_exe_path, ProcMaps,
    ProcMapsImpl,
};
use self::reinject::reinject_text;
use self::sections::synthesize_sections;

#[cfg(target_pointer_width = "64")]
pub use goblin::elf64 as elf;

#[cfg(target_pointer_width = "64")]
pub type ElfPtrSize = u64;

#[cfg(target_pointer_width = "32")]
pub use goblin::elf32 as elf;

#[cfg(target_pointer_width = "32")]
pub type ElfPtrSize = u32;

#[derive(FromArgs)]
/// Reconstructs a kernel-produced core dump into an extended core file:
/// still structurally a core (program headers, notes, memory images), but
/// with a synthesized section header table, reinjected text segments,
/// reconstructed function symbols and appended process metadata, so that
/// section-aware forensic tooling can consume it directly.
struct ExcoreArgs {
    /// basename of the crashing executable, matched against the NT_FILE table
    #[argh(option, short = 'e')]
    exe_comm: String,

    /// pid of the crashing process
    #[argh(option, short = 'p')]
    pid: i32,

    /// where to write the reconstructed core
    #[argh(option, short = 'o')]
    output: PathBuf,

    /// path of the kernel-produced core file
    #[argh(option, short = 'c')]
    core_file: Option<PathBuf>,

    /// read the core byte stream from standard input
    #[argh(switch, short = 'i')]
    stdin_input: bool,

    /// also materialize every shared library's full text image
    #[argh(switch, short = 't')]
    include_all_text: bool,

    /// flag shared objects that look injected
    #[argh(switch, short = 'h')]
    heuristics: bool,

    /// verbose output
    #[argh(switch, short = 'V')]
    verbose: bool,
}

pub fn main() -> Result<()> {
    // Disable coredumping of this process
    let dumpable_result = set_dumpable(false);

    let args: ExcoreArgs = argh::from_env();

    let log_level = if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    // When the kernel executes a core dump handler, stdout/stderr go nowhere.
    // Log to the kernel ring buffer to aid debugging:
    init_kernel_logger(log_level);

    if let Err(e) = dumpable_result {
        warn!("Failed to set dumpable: {}", e);
    };

    process_core(&args).wrap_err(format!("Error reconstructing core for PID {}", args.pid))
}

fn process_core(args: &ExcoreArgs) -> Result<()> {
    spool_core_input(args)?;

    let mut core = CoreImage::open(&args.output)?;
    let state = ProcessState::from_note_bytes(core.note_bytes())?;
    info!(
        "Reconstructing core for '{}' ({} threads)",
        state.comm(),
        state.thread_count()
    );

    let maps = classify_mappings(&ProcMapsImpl::new(args.pid).get_process_maps()?);
    let fd_table = read_fd_table(args.pid)?;
    let exe_path = resolve_exe_path(args.pid)?;
    let exe = ExeImage::open(&exe_path)
        .wrap_err_with(|| format!("Unable to read executable {}", exe_path.display()))?;
    if exe.machine != core.elf_header().e_machine {
        warn!(
            "Executable machine {:#x} does not match core {:#x}",
            exe.machine,
            core.elf_header().e_machine
        );
    }

    let layout = resolve_layout(&exe, &state, &core, &args.exe_comm)?;

    reinject_executable_text(args.pid, &mut core, &layout, &state)?;

    let mut libraries = collect_libraries(&maps);
    if args.include_all_text {
        reinject_library_texts(args.pid, &mut core, &libraries)?;
    }

    // Every later offset depends on the final segment layout, so the table
    // is resolved again against the rewritten file.
    let layout = resolve_layout(&exe, &state, &core, &args.exe_comm)?;
    let overrides = LayoutOverrides::from_exe(&exe, &layout);

    assign_core_offsets(&mut libraries, &core);
    if args.heuristics {
        let needed = resolve_needed_names(&core, &layout.dyn_info);
        let interp_path = read_interp_path(&core, &layout);
        mark_injected_libraries(&mut libraries, &needed, interp_path.as_deref());
    }

    let mut personality = 0u32;
    if layout.static_linked {
        personality |= PERSONALITY_STATIC;
    }
    if layout.pie {
        personality |= PERSONALITY_PIE;
    }
    if args.heuristics {
        personality |= PERSONALITY_HEURISTICS;
    }
    if overrides.stripped {
        personality |= PERSONALITY_STRIPPED_SHDRS;
    }

    let mut output = OpenOptions::new().read(true).write(true).open(&args.output)?;
    let payload_offsets =
        append_payloads(&mut output, &state, &exe_path, &fd_table, personality)?;

    let plan = synthesize_sections(
        &mut output,
        &core,
        &layout,
        &overrides,
        &payload_offsets,
        &libraries,
        &maps,
    )?;

    let symbol_count = reconstruct_local_symbols(&mut output, &core, &plan, &EhFrameWalker)?;
    output.sync_all()?;

    info!(
        "Wrote {} with {} sections and {} reconstructed symbols",
        args.output.display(),
        plan.section_count,
        symbol_count
    );
    Ok(())
}

/// Materializes the full executable text image over the kernel's one-page
/// stub. Fatal on failure: an extended core without its text is useless.
fn reinject_executable_text(
    pid: i32,
    core: &mut CoreImage,
    layout: &LayoutTable,
    state: &ProcessState,
) -> Result<()> {
    let text_ph = *core
        .load_segment_containing(layout.text.vaddr)
        .ok_or_else(|| eyre!("Core has no load segment for text"))?;

    if let Some(page_size) = state.page_size() {
        if text_ph.p_filesz != text_ph.p_memsz && page_size as ElfPtrSize != text_ph.p_filesz {
            warn!(
                "Kernel text stub is {:#x} bytes but AT_PAGESZ is {:#x}",
                text_ph.p_filesz, page_size
            );
        }
    }

    let image = read_process_memory(pid, text_ph.p_vaddr, text_ph.p_memsz as usize)?;
    reinject_text(core, text_ph.p_vaddr, &image)?;
    drop(image);
    core.reload()
}

/// Repeats the reinjection transform for each shared library's text, against
/// the then-current file. Per-library failures are soft: the library keeps
/// its stub.
fn reinject_library_texts(
    pid: i32,
    core: &mut CoreImage,
    libraries: &[LibraryRecord],
) -> Result<()> {
    for library in libraries.iter().filter(|l| l.is_executable()) {
        let text_ph = match core.load_segment_containing(library.base) {
            Some(ph) => *ph,
            None => {
                warn!("{}: no core segment at {:#x}", library.name, library.base);
                continue;
            }
        };
        if text_ph.p_filesz == text_ph.p_memsz {
            continue;
        }

        let result = read_process_memory(pid, text_ph.p_vaddr, text_ph.p_memsz as usize)
            .and_then(|image| reinject_text(core, text_ph.p_vaddr, &image));
        match result {
            Ok(_) => core.reload()?,
            Err(e) => warn!("Skipping text of {}: {}", library.name, e),
        }
    }
    Ok(())
}

fn read_interp_path(core: &CoreImage, layout: &LayoutTable) -> Option<PathBuf> {
    let interp = layout.interp.as_ref()?;
    let bytes = core.bytes_at(interp.vaddr, interp.size as usize)?;
    CStr::from_bytes_until_nul(bytes)
        .ok()
        .map(|s| PathBuf::from(s.to_string_lossy().into_owned()))
}

/// Lands the input core at the output path; everything downstream mutates
/// that one file.
fn spool_core_input(args: &ExcoreArgs) -> Result<()> {
    match (&args.core_file, args.stdin_input) {
        (Some(_), true) => Err(eyre!("-c and -i are mutually exclusive")),
        (None, false) => Err(eyre!("Either -c <core-file> or -i is required")),
        (Some(core_file), false) => {
            fs::copy(core_file, &args.output)?;
            Ok(())
        }
        (None, true) => {
            let mut writer = BufWriter::new(File::create(&args.output)?);
            let mut reader = BufReader::new(io::stdin().lock());
            io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            Ok(())
        }
    }
}

fn init_kernel_logger(level: LevelFilter) {
    // kernlog::init() reads KERNLOG_LEVEL to set the level. There is no
    // public interface to set it otherwise, so if the environment variable is
    // not set, set it according to the --verbose flag:
    if var("KERNLOG_LEVEL").is_err() {
        set_var("KERNLOG_LEVEL", level.as_str());
    }
    // Fall back to standard error if the kernel log is not available.

    let logger: Box<dyn Log> = match KernelLog::from_env() {
        Ok(logger) => Box::new(logger),
        Err(_) => Box::new(super::build_logger(level)),
    };

    log::set_boxed_logger(logger).unwrap();
    log::set_max_level(level);
}
