/// Ember kernel build script.
///
/// Picks the linker script for the bare-metal targets and validates the
/// build-time configuration overrides read by `config.rs`.
fn main() {
    println!("cargo:rerun-if-env-changed=EMBER_BRK_MAX");
    println!("cargo:rerun-if-env-changed=EMBER_LOG");
    println!("cargo:rerun-if-env-changed=EMBER_TRACE_SYSCALLS");

    if let Ok(value) = std::env::var("EMBER_BRK_MAX") {
        match parse_size(&value) {
            Some(v) if v != 0 && v % 4096 == 0 => {}
            _ => panic!("EMBER_BRK_MAX={} must be a non-zero multiple of 4096", value),
        }
    }

    // Host target (unit tests): nothing to link.
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if os != "none" {
        return;
    }

    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let script = match arch.as_str() {
        "x86_64" => "linker-x86_64.ld",
        "aarch64" => "linker-aarch64.ld",
        other => panic!("unsupported target architecture {}", other),
    };

    let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
    println!("cargo:rustc-link-arg-bins=-T{}/{}", dir, script);
    println!("cargo:rustc-link-arg-bins=-nostdlib");
    println!("cargo:rustc-link-arg-bins=-static");
    println!("cargo:rustc-link-arg-bins=-zmax-page-size=0x1000");
    println!("cargo:rerun-if-changed={}", script);
}

fn parse_size(s: &str) -> Option<usize> {
    let s = s.replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
