use std::process::Command;

const VERSION_ENV: &str = "CADENCE_GIT_SHA";

/// `git describe` of the checkout, or `unknown` outside a repository.
/// Release builds from a tarball can set `CADENCE_GIT_SHA` themselves.
fn describe() -> String {
    if let Ok(preset) = std::env::var(VERSION_ENV) {
        return preset;
    }
    Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|desc| desc.trim().to_string())
        .filter(|desc| !desc.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env={VERSION_ENV}={}", describe());
    println!("cargo:rerun-if-env-changed={VERSION_ENV}");
    for watched in ["../../.git/HEAD", "../../.git/index"] {
        println!("cargo:rerun-if-changed={watched}");
    }
}
