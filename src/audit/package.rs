//! Package-level checks: executable files and install-time scripts

use super::{SecurityFinding, Severity};
use anyhow::{Context, Result};
use std::path::Path;

const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "ts", "py", "sh", "bash", "ps1", "bat", "cmd", "exe", "dll", "so",
    "dylib", "rb", "pl",
];

const LIFECYCLE_SCRIPTS: &[&str] = &[
    "preinstall",
    "install",
    "postinstall",
    "preuninstall",
    "postuninstall",
];

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target"];

/// Audit the directory a workflow package ships in
pub fn audit_package(dir: &Path) -> Result<Vec<SecurityFinding>> {
    if !dir.is_dir() {
        anyhow::bail!("package directory not found: {}", dir.display());
    }

    let mut findings = Vec::new();
    let mut executables = Vec::new();
    walk(dir, dir, &mut executables)?;
    executables.sort();
    for path in executables {
        findings.push(SecurityFinding::new(
            Severity::Critical,
            format!("package contains executable file '{}'", path),
            None,
        ));
    }

    let package_json = dir.join("package.json");
    if package_json.exists() {
        let content = std::fs::read_to_string(&package_json)
            .with_context(|| format!("Failed to read {}", package_json.display()))?;

        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(parsed) => {
                if let Some(scripts) = parsed.get("scripts").and_then(|v| v.as_object()) {
                    for name in LIFECYCLE_SCRIPTS {
                        if scripts.contains_key(*name) {
                            findings.push(SecurityFinding::new(
                                Severity::Critical,
                                format!("package.json declares a '{}' lifecycle script", name),
                                None,
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %package_json.display(), error = %e, "unparseable package.json");
            }
        }
    }

    tracing::debug!(dir = %dir.display(), findings = findings.len(), "audited package");
    Ok(findings)
}

fn walk(root: &Path, dir: &Path, executables: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            walk(root, &path, executables)?;
        } else if file_type.is_file() && is_executable(&path) {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            executables.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            EXECUTABLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}
