//! Security policy for generated bundles
//!
//! The validator is pure: it inspects file paths, file contents and
//! dependencies and returns every violation it finds. Nothing is written to
//! disk and no process is started until a bundle passes.
//!
//! Dependencies come from two places: the map the caller declares and the
//! dependency sections of the bundle's own manifest. Both are checked, and
//! [`SecurityValidator::admit`] rewrites the manifest so the install step
//! sees exactly the set that was checked.

use crate::limits::BundleLimits;
use crate::types::{DependencyMap, FileMap};
use crate::workspace::{BUILD_DESCRIPTOR_NAME, LOG_FILE_NAME};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::LazyLock;

/// Packages that grant process, filesystem, network or dynamic-code
/// capabilities. Entries are in normalized form (lower-case, `-` separated,
/// no scope).
pub const DEFAULT_DENYLIST: &[&str] = &[
    "child-process",
    "shelljs",
    "execa",
    "cross-spawn",
    "node-pty",
    "pty.js",
    "sudo-prompt",
    "node-cmd",
    "exec-sh",
    "fs-extra",
    "graceful-fs",
    "node-ffi",
    "ffi-napi",
    "ref-napi",
    "raw-socket",
    "net-ping",
    "ssh2",
    "telnet-client",
    "vm2",
    "isolated-vm",
    "safe-eval",
    "node-serialize",
    "require-from-string",
    "systeminformation",
];

const DISALLOWED_EXTENSIONS: &[&str] = &[
    "sh", "bash", "exe", "bat", "cmd", "ps1", "com", "dll", "so", "dylib", "bin", "msi", "jar",
    "node",
];

const RESERVED_NAMES: &[&str] = &[LOG_FILE_NAME, BUILD_DESCRIPTOR_NAME];

/// Manifest sections folded into the checked dependency set
const INSTALLED_SECTIONS: &[&str] = &["dependencies", "optionalDependencies", "peerDependencies"];

/// Sections stripped from an admitted manifest. `devDependencies` is never
/// checked, so it is never left behind for an install step to fetch.
const PINNED_SECTIONS: &[&str] = &[
    "dependencies",
    "optionalDependencies",
    "peerDependencies",
    "devDependencies",
    "bundleDependencies",
    "bundledDependencies",
];

static VERSION_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\^~]?[A-Za-z0-9][A-Za-z0-9.\-]*$").expect("valid version regex")
});

static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9~][a-z0-9._~-]*/)?[a-z0-9~][a-z0-9._~-]*$").expect("valid name regex")
});

static RESTRICTED_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\brequire\s*\(\s*|\bfrom\s+|\bimport\s*\(\s*|\bimport\s+)['"`](?:node:)?(child_process|fs|fs/promises|os|net|dgram|vm|worker_threads)['"`]"#,
    )
    .expect("valid module regex")
});

static CONTENT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("eval", r"\beval\s*\("),
        ("function-constructor", r"\bnew\s+Function\s*\("),
        ("string-timer", r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#),
        ("process-binding", r"\bprocess\s*\.\s*(?:binding|dlopen|kill)\b"),
        ("html-sink", r"\.\s*(?:inner|outer)HTML\s*=[^=]"),
        ("document-write", r"\bdocument\s*\.\s*write(?:ln)?\s*\("),
        ("dangerously-set-inner-html", r"\bdangerouslySetInnerHTML\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid content regex")))
    .collect()
});

/// Validator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Require every dependency to appear on `allowlist`
    pub strict: bool,

    /// Dependencies accepted in strict mode
    pub allowlist: Vec<String>,

    /// Entries added to the built-in denylist
    pub extra_denylist: Vec<String>,

    /// Manifest every bundle must contain
    pub manifest_file: String,

    /// Entry point used when the manifest declares no `main`
    pub entry_file: String,

    pub bundle: BundleLimits,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strict: false,
            allowlist: Vec::new(),
            extra_denylist: Vec::new(),
            manifest_file: "package.json".into(),
            entry_file: "index.js".into(),
            bundle: BundleLimits::default(),
        }
    }
}

/// Rule family a violation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    Dependency,
    Content,
    Structure,
    Size,
}

/// One failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    /// Offending dependency name or file path
    pub subject: String,
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.detail)
    }
}

/// Outcome of validating a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub violations: Vec<Violation>,
}

impl ValidationVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Whether any violation names `subject`
    pub fn mentions(&self, subject: &str) -> bool {
        self.violations.iter().any(|v| v.subject == subject)
    }

    fn push(&mut self, rule: Rule, subject: impl Into<String>, detail: impl Into<String>) {
        self.violations.push(Violation {
            rule,
            subject: subject.into(),
            detail: detail.into(),
        });
    }
}

impl std::fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed() {
            return f.write_str("no violations");
        }
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Static policy checker for generated bundles
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    config: PolicyConfig,
    denylist: Vec<String>,
    allowlist: Vec<String>,
}

impl SecurityValidator {
    pub fn new(config: PolicyConfig) -> Self {
        let denylist = DEFAULT_DENYLIST
            .iter()
            .map(|name| name.to_string())
            .chain(config.extra_denylist.iter().map(|name| normalize_name(name)))
            .collect();
        let allowlist = config.allowlist.iter().map(|name| name.to_lowercase()).collect();

        Self {
            config,
            denylist,
            allowlist,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Apply every rule to a full bundle.
    ///
    /// `declared` is checked together with the manifest's own dependency
    /// sections.
    pub fn validate(&self, files: &FileMap, declared: &DependencyMap) -> ValidationVerdict {
        let dependencies = self.resolve_dependencies(files, declared);
        let mut verdict = ValidationVerdict::default();
        self.check_dependencies(&dependencies, &mut verdict);
        self.check_paths(files, &mut verdict);
        self.check_structure(files, &mut verdict);
        self.check_manifest(files, declared, &mut verdict);
        self.check_content(files, &mut verdict);
        self.check_size(files, &mut verdict);
        verdict
    }

    /// Validate a full bundle and pin its manifest to the checked set.
    ///
    /// On success the manifest's `dependencies` object lists exactly the
    /// packages that passed the dependency rules and every other dependency
    /// section is gone. A manifest with nothing to pin is left untouched.
    pub fn admit(&self, mut files: FileMap, declared: &DependencyMap) -> Result<FileMap, ValidationVerdict> {
        let verdict = self.validate(&files, declared);
        if !verdict.passed() {
            return Err(verdict);
        }

        let dependencies = self.resolve_dependencies(&files, declared);
        let manifest_file = &self.config.manifest_file;
        let Some(raw) = files.get_mut(manifest_file) else {
            return Ok(files);
        };
        let Ok(serde_json::Value::Object(mut manifest)) = serde_json::from_str(raw) else {
            // check_manifest only lets a non-JSON manifest through when there is nothing to pin
            return Ok(files);
        };

        let mut stripped = false;
        for section in PINNED_SECTIONS {
            stripped |= manifest.remove(*section).is_some();
        }
        if dependencies.is_empty() && !stripped {
            return Ok(files);
        }

        let pinned = dependencies
            .into_iter()
            .map(|(name, version)| (name, serde_json::Value::String(version)))
            .collect();
        manifest.insert("dependencies".into(), serde_json::Value::Object(pinned));
        *raw = serde_json::to_string_pretty(&manifest).map_err(|e| {
            let mut verdict = ValidationVerdict::default();
            verdict.push(Rule::Structure, manifest_file, format!("cannot rewrite manifest: {e}"));
            verdict
        })?;
        Ok(files)
    }

    /// Rules that apply to a partial bundle (hot updates). A manifest in the
    /// update still has its dependencies checked.
    pub fn validate_files(&self, files: &FileMap) -> ValidationVerdict {
        let mut verdict = ValidationVerdict::default();
        if files.contains_key(&self.config.manifest_file) {
            let none = DependencyMap::new();
            self.check_dependencies(&self.resolve_dependencies(files, &none), &mut verdict);
            self.check_manifest(files, &none, &mut verdict);
        }
        self.check_paths(files, &mut verdict);
        self.check_content(files, &mut verdict);
        self.check_size(files, &mut verdict);
        verdict
    }

    /// Every dependency an install step would fetch: the manifest's
    /// `dependencies`, `optionalDependencies` and `peerDependencies`, with
    /// `declared` laid over them. Non-string versions are kept in their JSON
    /// form so the version rule rejects them.
    pub fn resolve_dependencies(&self, files: &FileMap, declared: &DependencyMap) -> DependencyMap {
        let mut resolved = DependencyMap::new();
        if let Some(serde_json::Value::Object(manifest)) = self.manifest(files) {
            for section in INSTALLED_SECTIONS {
                let Some(packages) = manifest.get(*section).and_then(|s| s.as_object()) else {
                    continue;
                };
                for (name, version) in packages {
                    let version = version.as_str().map_or_else(|| version.to_string(), str::to_string);
                    resolved.entry(name.clone()).or_insert(version);
                }
            }
        }
        resolved.extend(declared.iter().map(|(name, version)| (name.clone(), version.clone())));
        resolved
    }

    fn manifest(&self, files: &FileMap) -> Option<serde_json::Value> {
        let raw = files.get(&self.config.manifest_file)?;
        serde_json::from_str(raw).ok()
    }

    /// Entry point the run command is pointed at: the manifest's `main` when
    /// it declares one, otherwise the configured default.
    pub fn entry_point(&self, files: &FileMap) -> String {
        self.manifest(files)
            .and_then(|manifest| manifest.get("main")?.as_str().map(str::to_string))
            .map(|main| main.trim_start_matches("./").to_string())
            .unwrap_or_else(|| self.config.entry_file.clone())
    }

    fn check_dependencies(&self, dependencies: &DependencyMap, verdict: &mut ValidationVerdict) {
        for (name, version) in dependencies {
            if !PACKAGE_NAME.is_match(&name.to_lowercase()) {
                verdict.push(Rule::Dependency, name, "malformed package name");
                continue;
            }

            let normalized = normalize_name(name);
            if let Some(entry) = self.denylist.iter().find(|entry| denylist_match(&normalized, entry)) {
                verdict.push(
                    Rule::Dependency,
                    name,
                    format!("denylisted package (matches '{entry}')"),
                );
            }

            if !VERSION_SPEC.is_match(version) {
                verdict.push(
                    Rule::Dependency,
                    name,
                    format!("version '{version}' is not a plain version spec"),
                );
            }

            if self.config.strict && !self.allowlist.contains(&name.to_lowercase()) {
                verdict.push(Rule::Dependency, name, "not on the allowlist");
            }
        }
    }

    fn check_paths(&self, files: &FileMap, verdict: &mut ValidationVerdict) {
        for path in files.keys() {
            if let Err(detail) = check_relative_path(path) {
                verdict.push(Rule::Structure, path, detail);
                continue;
            }

            if RESERVED_NAMES.contains(&path.as_str()) {
                verdict.push(Rule::Structure, path, "reserved file name");
            }

            let extension = Path::new(path)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_lowercase);
            if let Some(ext) = extension.filter(|ext| DISALLOWED_EXTENSIONS.contains(&ext.as_str())) {
                verdict.push(Rule::Structure, path, format!("disallowed file type '.{ext}'"));
            }
        }
    }

    fn check_structure(&self, files: &FileMap, verdict: &mut ValidationVerdict) {
        let manifest = &self.config.manifest_file;
        if !files.contains_key(manifest) {
            verdict.push(Rule::Structure, manifest, "manifest missing");
            return;
        }

        let entry = self.entry_point(files);
        if !files.contains_key(&entry) {
            verdict.push(Rule::Structure, entry, "entry point missing");
        }
    }

    /// Dependency sections must be objects, and declared dependencies need a
    /// JSON manifest to be written into.
    fn check_manifest(&self, files: &FileMap, declared: &DependencyMap, verdict: &mut ValidationVerdict) {
        let manifest_file = &self.config.manifest_file;
        let Some(raw) = files.get(manifest_file) else {
            return;
        };

        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(manifest)) => {
                for section in PINNED_SECTIONS {
                    let malformed = match manifest.get(*section) {
                        Some(serde_json::Value::Object(_)) | None => false,
                        // npm accepts a list of names for bundled dependencies
                        Some(serde_json::Value::Array(_)) => !section.starts_with("bundle"),
                        Some(_) => true,
                    };
                    if malformed {
                        verdict.push(
                            Rule::Structure,
                            manifest_file,
                            format!("`{section}` must be an object"),
                        );
                    }
                }
            }
            _ if !declared.is_empty() => verdict.push(
                Rule::Structure,
                manifest_file,
                "declared dependencies need a JSON object manifest",
            ),
            _ => {}
        }
    }

    fn check_content(&self, files: &FileMap, verdict: &mut ValidationVerdict) {
        for (path, content) in files {
            for (name, pattern) in CONTENT_PATTERNS.iter() {
                if pattern.is_match(content) {
                    verdict.push(Rule::Content, path, format!("dangerous construct: {name}"));
                }
            }
            for captures in RESTRICTED_MODULE.captures_iter(content) {
                verdict.push(
                    Rule::Content,
                    path,
                    format!("restricted module: {}", &captures[1]),
                );
            }
        }
    }

    fn check_size(&self, files: &FileMap, verdict: &mut ValidationVerdict) {
        let limits = &self.config.bundle;

        if files.len() > limits.max_files {
            verdict.push(
                Rule::Size,
                "bundle",
                format!("{} files exceed the limit of {}", files.len(), limits.max_files),
            );
        }

        let mut total: u64 = 0;
        for (path, content) in files {
            let size = content.len() as u64;
            total = total.saturating_add(size);
            if size > limits.max_file_bytes {
                verdict.push(
                    Rule::Size,
                    path,
                    format!("{size} bytes exceed the per-file limit of {}", limits.max_file_bytes),
                );
            }
        }

        if total > limits.max_total_bytes {
            verdict.push(
                Rule::Size,
                "bundle",
                format!("{total} bytes exceed the total limit of {}", limits.max_total_bytes),
            );
        }
    }
}

/// Lower-case, strip any npm scope and fold `_` into `-`
pub fn normalize_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    let unscoped = match name.strip_prefix('@') {
        Some(scoped) => scoped.split_once('/').map(|(_, rest)| rest).unwrap_or(scoped),
        None => name.as_str(),
    };
    unscoped.replace('_', "-")
}

fn denylist_match(normalized: &str, entry: &str) -> bool {
    normalized == entry
        || normalized
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Lexical checks shared with the materializer
pub(crate) fn check_relative_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("empty path");
    }
    if path.contains('\\') || path.contains('\0') {
        return Err("path contains a backslash or NUL");
    }
    if path.starts_with('/') {
        return Err("absolute path");
    }
    // `Path::components` silently drops `.` and empty segments, so look at the
    // raw segments first.
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err("path contains an empty, '.' or '..' segment");
    }
    if !Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err("path is not a plain relative path");
    }
    Ok(())
}
