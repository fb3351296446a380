use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use libc::user_regs_struct as ElfGRegSet;
        pub use libc::user_fpregs_struct as ElfFpRegSet;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use libc::user_regs_struct as ElfGRegSet;
        pub use libc::user_fpsimd_struct as ElfFpRegSet;
    } else if #[cfg(target_arch = "arm")] {
        pub use libc::user_regs as ElfGRegSet;
        pub use libc::user_fpregs as ElfFpRegSet;
    } else if #[cfg(target_arch = "x86")] {
        pub use libc::user_regs_struct as ElfGRegSet;
        pub use libc::user_fpregs_struct as ElfFpRegSet;
    } else {
        // Dummy register sets for architectures we do not reconstruct on.
        // Keeps the crate compiling everywhere; the prstatus/fpregset size
        // checks will reject notes from unknown register layouts anyway.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ElfGRegSet;
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ElfFpRegSet;
    }
}
