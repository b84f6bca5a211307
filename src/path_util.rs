//! Filesystem helpers for log destinations: absolute paths, parent-dir
//! creation and the `$placeholder` expansion accepted in log path
//! templates.

use std::path::{Path, PathBuf};

use chrono::Local;

/// Resolve a possibly-relative path against the current directory without
/// touching the filesystem.
pub fn absolute(path: impl AsRef<Path>) -> std::io::Result<PathBuf> {
    std::path::absolute(path)
}

/// Create the parent directory chain of `path` if it is missing.
pub fn ensure_parent_exists(path: impl AsRef<Path>) -> std::io::Result<()> {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Expand the placeholders accepted in log path templates:
/// `$time` (`HH_MM_SS`), `$date` (`dd-mm-yyyy`), `$image` (the debuggee
/// image name), `$hostname`, `$username` and `$random` (0..1e6).
pub fn expand_placeholders(template: &str, image: &str) -> String {
    let mut result = template.to_string();

    if result.contains("$time") {
        result = result.replace("$time", &Local::now().format("%H_%M_%S").to_string());
    }
    if result.contains("$date") {
        result = result.replace("$date", &Local::now().format("%d-%m-%Y").to_string());
    }
    if result.contains("$image") {
        result = result.replace("$image", image);
    }
    if result.contains("$hostname") {
        result = result.replace("$hostname", &hostname());
    }
    if result.contains("$username") {
        result = result.replace("$username", &username());
    }
    if result.contains("$random") {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or(0);
        result = result.replace("$random", &(u64::from(nanos) % 1_000_000).to_string());
    }

    result
}

fn hostname() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default()
}

fn username() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_placeholder_expands() {
        assert_eq!(
            expand_placeholders("logs/$image.hind", "app.exe"),
            "logs/app.exe.hind"
        );
    }

    #[test]
    fn plain_templates_pass_through() {
        assert_eq!(expand_placeholders("crash.hind", "app.exe"), "crash.hind");
    }

    #[test]
    fn random_yields_a_number() {
        let expanded = expand_placeholders("$random", "app.exe");
        assert!(expanded.parse::<u64>().is_ok());
    }
}
