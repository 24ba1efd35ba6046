// SPDX-License-Identifier: MPL-2.0

use std::process::Command;

fn main() {
    // Re-run build script if git HEAD changes
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-env-changed=CAMERA_FANOUT_VERSION");

    // Packagers may pin the version explicitly
    let version = std::env::var("CAMERA_FANOUT_VERSION").unwrap_or_else(|_| describe());

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

fn describe() -> String {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            version
                .strip_prefix('v')
                .map(str::to_string)
                .unwrap_or(version)
        }
        _ => env!("CARGO_PKG_VERSION").to_string(),
    }
}
