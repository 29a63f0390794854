use std::env;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|out| out.trim().to_string())
}

fn main() {
    // Release pipelines build from a tarball and pass the commit in
    let git_sha = env::var("RUN_SUMMARY_GIT_SHA").unwrap_or_else(|_| {
        match git(&["rev-parse", "--short=10", "HEAD"]).filter(|sha| !sha.is_empty()) {
            Some(sha) => {
                let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
                    .is_some_and(|status| !status.is_empty());
                if dirty { format!("{}-dirty", sha) } else { sha }
            }
            None => "unknown".to_string(),
        }
    });

    let build_date = env::var("RUN_SUMMARY_BUILD_DATE")
        .unwrap_or_else(|_| chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=RUN_SUMMARY_GIT_SHA={}", git_sha);
    println!("cargo:rustc-env=RUN_SUMMARY_BUILD_DATE={}", build_date);
    println!("cargo:rustc-env=RUN_SUMMARY_TARGET={}", target);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=RUN_SUMMARY_GIT_SHA");
    println!("cargo:rerun-if-env-changed=RUN_SUMMARY_BUILD_DATE");
}
