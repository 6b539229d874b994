use std::{env, fs, path::Path};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=protos");

    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["protos"])
        .input("protos/testapp_index.proto")
        .cargo_out_dir("protos")
        .run_from_script();

    let out = Path::new(&env::var("OUT_DIR").expect("OUT_DIR")).join("current_version.rs");
    fs::write(&out, version_const(env!("CARGO_PKG_VERSION"))).expect("write current_version.rs");
}

/// Render `major.minor.patch[-extra]` as a `Version` constant
fn version_const(version: &str) -> String {
    let (numbers, extra) = match version.split_once('-') {
        Some((n, e)) => (n, format!("Some(\"{}\")", e)),
        None => (version, String::from("None")),
    };
    let parts: Vec<&str> = numbers.split('.').collect();
    let [major, minor, patch] = parts[..] else {
        panic!("unexpected package version {}", version);
    };
    format!(
        "pub const VERSION: Version = Version {{ major: {}, minor: {}, patch: {}, extra: {} }};\n",
        major, minor, patch, extra
    )
}
