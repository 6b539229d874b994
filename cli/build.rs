use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};

const REVISION_ENV: &str = "HARRIER_GIT_REVISION";

fn main() {
    println!("cargo:rerun-if-env-changed={}", REVISION_ENV);
    if let Err(e) = write_version_files() {
        panic!("Failed to create the version files: {:?}", e);
    }
}

fn out_file(name: &str) -> PathBuf {
    Path::new(&env::var("OUT_DIR").unwrap()).join(name)
}

fn write_version_files() -> io::Result<()> {
    let version = env::var("CARGO_PKG_VERSION").unwrap();
    let target = env::var("TARGET").unwrap();
    let rev = git_rev().unwrap_or_else(|| String::from("unknown"));

    let mut simple = fs::File::create(out_file("simple_version_string"))?;
    write!(&mut simple, "\"{}\"", version)?;

    let mut full = fs::File::create(out_file("version_string"))?;
    write!(
        &mut full,
        "r#\"{} ({})\nrev {}\"#",
        version,
        target,
        rev.trim()
    )?;
    Ok(())
}

/// The revision from the environment, then git, then the checked out ref
fn git_rev() -> Option<String> {
    if let Ok(rev) = env::var(REVISION_ENV) {
        return Some(rev);
    }
    let from_git = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok());
    if from_git.is_some() {
        return from_git;
    }
    let head = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap()).join("../.git/refs/heads/main");
    fs::read_to_string(head).ok()
}
