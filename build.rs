use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

/// rustfmt's `max_width`; longer lines mean the file was never formatted.
const MAX_LINE_WIDTH: usize = 100;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "yaml", "toml"];

/// Only the crate's own sources are checked.
const CHECKED_DIRS: &[&str] = &["src"];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");

    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=PROMPTR_SYNC_GIT_SHA={}", sha);

    enforce_line_limits();
    enforce_line_width();
    enforce_no_dead_code_allows();
}

fn enforce_line_limits() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);

    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    let mut violations = Vec::new();
    for file in &files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let line_count = count_non_empty_lines(&content);
                if line_count > MAX_LINES {
                    let rel_path = file.strip_prefix(&root).unwrap_or(file);
                    violations.push((rel_path.to_path_buf(), line_count));
                }
            }
            Err(e) => {
                let rel_path = file.strip_prefix(&root).unwrap_or(file);
                println!(
                    "cargo:warning=Could not read file {}: {}",
                    rel_path.display(),
                    e
                );
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES);
        eprintln!("========================================");
        for (path, lines) in &violations {
            eprintln!(
                "  {} - {} lines (exceeds by {})",
                path.display(),
                lines,
                lines - MAX_LINES
            );
        }
        eprintln!("========================================\n");
        panic!(
            "Build failed: {} file(s) exceed the {} line limit",
            violations.len(),
            MAX_LINES
        );
    }
}

fn enforce_line_width() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);

    let mut violations = Vec::new();
    for file in collect_files_to_check(&root)
        .into_iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("rs"))
    {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (line_num, line) in content.lines().enumerate() {
            let width = line.chars().count();
            if width > MAX_LINE_WIDTH {
                let rel_path = file.strip_prefix(&root).unwrap_or(&file).to_path_buf();
                violations.push(format!(
                    "{}:{} ({} columns)",
                    rel_path.display(),
                    line_num + 1,
                    width
                ));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("LINE WIDTH EXCEEDED (max {} columns)", MAX_LINE_WIDTH);
        eprintln!("========================================");
        for violation in &violations {
            eprintln!("  {}", violation);
        }
        eprintln!("\nRun `cargo fmt`; wrap long literals by hand.\n");
        panic!(
            "Build failed: {} line(s) exceed {} columns",
            violations.len(),
            MAX_LINE_WIDTH
        );
    }
}

fn enforce_no_dead_code_allows() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);

    let mut violations = Vec::new();
    for file in collect_files_to_check(&root)
        .into_iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("rs"))
    {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
            {
                let rel_path = file.strip_prefix(&root).unwrap_or(&file).to_path_buf();
                violations.push(format!("{}:{}", rel_path.display(), line_num + 1));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("#[allow(dead_code)] IS NOT ALLOWED");
        eprintln!("========================================");
        for violation in &violations {
            eprintln!("  {}", violation);
        }
        eprintln!("\nDelete unused code or gate test helpers with #[cfg(test)].\n");
        panic!(
            "Build failed: {} #[allow(dead_code)] occurrence(s) found",
            violations.len()
        );
    }
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in CHECKED_DIRS {
        walk_directory(&root.join(dir), &mut files);
    }
    files
}

fn walk_directory(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_directory(&path, files);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
}

fn count_non_empty_lines(content: &str) -> usize {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}
