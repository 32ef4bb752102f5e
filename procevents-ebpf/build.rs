use which::which;

/// Rebuild the programs when the linker changes; aya-build does not track it.
fn main() {
    match which("bpf-linker") {
        Ok(bpf_linker) => println!("cargo:rerun-if-changed={}", bpf_linker.display()),
        Err(e) => println!("cargo:warning=bpf-linker not found: {e}"),
    }
}
