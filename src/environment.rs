//! Deciding whether a directory is a managed environment.
//!
//! An environment root carries a `KEY=value` declaration file, either
//! `.env.example` (preferred, the template's intent) or `.env` (the runtime
//! copy). It must enable the `ANYDEV` marker and name its template in
//! `ANYDEV_TEMPLATE`.

use crate::error::{AnydevError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const MARKER_KEY: &str = "ANYDEV";
pub const TEMPLATE_KEY: &str = "ANYDEV_TEMPLATE";
pub const UNKNOWN_TEMPLATE: &str = "unknown";

const DECLARATION_FILES: [&str; 2] = [".env.example", ".env"];
const TRUTHY_VALUES: [&str; 3] = ["true", "1", "yes"];
const MAX_FOLDER_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub name: String,
    pub path: PathBuf,
    pub template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defect {
    MissingDeclaration,
    MarkerNotEnabled,
    TemplateMissing,
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDeclaration => write!(f, "no .env.example or .env file"),
            Self::MarkerNotEnabled => {
                write!(f, "{MARKER_KEY} variable is not present or enabled")
            }
            Self::TemplateMissing => write!(f, "{TEMPLATE_KEY} variable is not present"),
        }
    }
}

/// Outcome of checking one directory. All defects are collected; any one of
/// them disqualifies the directory.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub declaration: Option<PathBuf>,
    pub values: BTreeMap<String, String>,
    pub defects: Vec<Defect>,
}

impl Inspection {
    pub fn is_environment(&self) -> bool {
        self.defects.is_empty()
    }

    pub fn template(&self) -> Option<&str> {
        self.values.get(TEMPLATE_KEY).map(String::as_str)
    }

    pub fn summary(&self) -> String {
        self.defects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn is_truthy(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    TRUTHY_VALUES.contains(&lowered.as_str())
}

pub fn declaration_file(dir: &Path) -> Option<PathBuf> {
    DECLARATION_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Checks `dir` and reports why it does or does not qualify. A missing
/// declaration file is a normal negative result; a declaration file that
/// exists but cannot be read is an error.
pub fn inspect(dir: &Path) -> Result<Inspection> {
    let Some(declaration) = declaration_file(dir) else {
        tracing::warn!(path = %dir.display(), "directory is not an anydev environment");
        return Ok(Inspection {
            declaration: None,
            values: BTreeMap::new(),
            defects: vec![Defect::MissingDeclaration],
        });
    };

    let values = read_declaration(&declaration)?;
    let mut defects = Vec::new();
    if !values.get(MARKER_KEY).is_some_and(|v| is_truthy(v)) {
        tracing::warn!(
            file = %declaration.display(),
            "{MARKER_KEY} variable is not present or enabled"
        );
        defects.push(Defect::MarkerNotEnabled);
    }
    if !values.contains_key(TEMPLATE_KEY) {
        tracing::warn!(
            file = %declaration.display(),
            "{TEMPLATE_KEY} variable is not present"
        );
        defects.push(Defect::TemplateMissing);
    }

    Ok(Inspection {
        declaration: Some(declaration),
        values,
        defects,
    })
}

pub fn is_environment(dir: &Path) -> Result<bool> {
    Ok(inspect(dir)?.is_environment())
}

/// Identity of the environment rooted at `dir`. Fails only when there is no
/// declaration file at all; a missing template reads as `unknown`. The name
/// is the basename of `dir` as given, so a symlinked directory keeps its own
/// name while `path` points at the resolved location.
pub fn describe(dir: &Path) -> Result<Environment> {
    let inspection = inspect(dir)?;
    if inspection.declaration.is_none() {
        return Err(AnydevError::Validation(format!(
            "no environment declaration found in {}",
            dir.display()
        )));
    }
    let absolute = std::path::absolute(dir)?;
    let path = fs::canonicalize(dir)?;
    let name = absolute
        .file_name()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    let template = inspection
        .template()
        .unwrap_or(UNKNOWN_TEMPLATE)
        .to_string();
    Ok(Environment {
        name,
        path,
        template,
    })
}

/// One `KEY=value` per line. Each line is parsed on its own so a malformed
/// line (an unterminated quote included) is skipped without swallowing the
/// lines after it.
fn read_declaration(file: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(file).map_err(|err| AnydevError::Parse {
        path: file.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut values = BTreeMap::new();
    for (number, line) in content.lines().enumerate() {
        for item in dotenvy::from_read_iter(line.as_bytes()) {
            match item {
                Ok((key, value)) => {
                    values.insert(key, value);
                }
                Err(err) => {
                    tracing::debug!(
                        file = %file.display(),
                        line = number + 1,
                        "skipping malformed line: {err}"
                    );
                    break;
                }
            }
        }
    }
    Ok(values)
}

/// Replaces anything outside `[A-Za-z0-9_-. ]` (plus other Unicode word
/// characters and whitespace) with `_`, trims, and caps the length.
pub fn sanitize_folder_name(folder_name: &str) -> String {
    let replaced: String = folder_name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c.is_whitespace() {
                c
            } else {
                '_'
            }
        })
        .collect();
    replaced
        .trim()
        .chars()
        .take(MAX_FOLDER_NAME_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn truthy_allow_list_is_case_insensitive() {
        for value in ["true", "TRUE", "True", "1", "yes", "YES", " yes "] {
            assert!(is_truthy(value), "{value} should be truthy");
        }
        for value in ["false", "0", "no", "", "on", "y"] {
            assert!(!is_truthy(value), "{value} should not be truthy");
        }
    }

    #[test]
    fn directory_without_declaration_is_not_environment() {
        let dir = tempdir().unwrap();
        assert!(!is_environment(dir.path()).unwrap());
        let inspection = inspect(dir.path()).unwrap();
        assert_eq!(inspection.defects, vec![Defect::MissingDeclaration]);
        assert!(describe(dir.path()).is_err());
    }

    #[test]
    fn valid_declaration_describes_environment() {
        let root = tempdir().unwrap();
        let dir = root.path().join("shop.site.test");
        fs::create_dir(&dir).unwrap();
        write(&dir, ".env.example", "ANYDEV=true\nANYDEV_TEMPLATE=python\n");

        assert!(is_environment(&dir).unwrap());
        let env = describe(&dir).unwrap();
        assert_eq!(env.template, "python");
        assert_eq!(env.name, "shop.site.test");
        assert!(env.path.is_absolute());
        assert_eq!(env.path, fs::canonicalize(&dir).unwrap());
    }

    #[test]
    fn example_file_wins_over_active_file() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".env", "ANYDEV=false\n");
        write(dir.path(), ".env.example", "ANYDEV=yes\nANYDEV_TEMPLATE=node\n");
        assert!(is_environment(dir.path()).unwrap());
        assert_eq!(describe(dir.path()).unwrap().template, "node");
    }

    #[test]
    fn active_file_is_used_when_example_missing() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".env", "ANYDEV=1\nANYDEV_TEMPLATE=php\n");
        let inspection = inspect(dir.path()).unwrap();
        assert!(inspection.is_environment());
        assert_eq!(inspection.declaration, Some(dir.path().join(".env")));
    }

    #[test]
    fn defects_accumulate() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".env.example", "OTHER=1\n");
        let inspection = inspect(dir.path()).unwrap();
        assert_eq!(
            inspection.defects,
            vec![Defect::MarkerNotEnabled, Defect::TemplateMissing]
        );
        assert!(inspection.summary().contains("ANYDEV_TEMPLATE"));
    }

    #[test]
    fn missing_template_alone_disqualifies_but_describes_as_unknown() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".env.example", "ANYDEV=true\n");
        assert!(!is_environment(dir.path()).unwrap());
        assert_eq!(describe(dir.path()).unwrap().template, UNKNOWN_TEMPLATE);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            ".env.example",
            "# comment\nthis line has no equals\nANYDEV=true\nANYDEV_TEMPLATE=go\n",
        );
        assert!(is_environment(dir.path()).unwrap());
    }

    #[test]
    fn unterminated_quote_only_skips_its_own_line() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            ".env.example",
            "GREETING=\"hi\nANYDEV=true\nANYDEV_TEMPLATE=python\n",
        );
        let inspection = inspect(dir.path()).unwrap();
        assert!(inspection.defects.is_empty(), "{:?}", inspection.defects);
        assert_eq!(inspection.template(), Some("python"));
        assert!(!inspection.values.contains_key("GREETING"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_keeps_its_own_name() {
        let root = tempdir().unwrap();
        let target = root.path().join("real-shop");
        fs::create_dir(&target).unwrap();
        write(&target, ".env.example", "ANYDEV=true\nANYDEV_TEMPLATE=php\n");
        let link = root.path().join("shop");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let env = describe(&link).unwrap();
        assert_eq!(env.name, "shop");
        assert_eq!(env.path, fs::canonicalize(&target).unwrap());
    }

    #[test]
    fn unreadable_declaration_is_parse_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".env.example"), [0xff, 0xfe, 0x00, 0x41]).unwrap();
        let err = inspect(dir.path()).expect_err("invalid utf-8 should fail");
        assert!(matches!(err, AnydevError::Parse { .. }));
    }

    #[test]
    fn sanitize_folder_name_matches_allow_list() {
        let name = "Valid_Folder-Name 123.4";
        assert_eq!(sanitize_folder_name(name), name);
        assert_eq!(
            sanitize_folder_name("Inval*id:Fol*der|Name 123.4"),
            "Inval_id_Fol_der_Name 123.4"
        );
        assert_eq!(
            sanitize_folder_name("  Valid Folder Name 123.4  "),
            "Valid Folder Name 123.4"
        );
        assert_eq!(sanitize_folder_name(&"a".repeat(256)), "a".repeat(255));
    }
}
