//! Exposes the compilation target to the crate.

fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();
    println!("cargo:rustc-env=CLOUDSYNC_TARGET={target}");
    println!("cargo:rerun-if-changed=build.rs");
}
