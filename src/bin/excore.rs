use excore::cli;

/// excore is invoked by the kernel core_pattern dispatcher with the dying
/// process still frozen in the kernel's coredump path. All of the actual work
/// lives in the library so it can be exercised by tests; this binary only
/// forwards to it.
fn main() {
    cli::main()
}
