//! Turns raw agent text into `(relative path, contents, kind)` artifacts.
//!
//! Agents emit fenced code blocks; this module finds them, infers a relative
//! path for each, and classifies the result as source, test, or
//! documentation.  The extractor is content-oblivious beyond those rules —
//! semantic correctness of the generated code is not its business.
//!
//! Path inference, in priority order:
//! 1. A file-path hint on the line immediately before the opening fence
//!    (`# path/to/file.ext`, `filename: path/to/file.ext`, case-insensitive).
//! 2. A labelled comment hint on the first line inside the block
//!    (`# path: src/add.py`, `// file: lib.rs`).
//! 3. An extension inferred from the fence language tag, with the filename
//!    stem taken from the first symbol-like token in the block (a function,
//!    class, or struct name) or, failing that, the block's sequence number.
//!
//! Paths that would escape the project root are rejected and the block is
//! dropped.

/// Classification of an extracted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Production source, placed under `src/`.
    Src,
    /// Test code, placed under `tests/`.
    Test,
    /// Documentation (`.md`/`.rst`/`.txt`), placed at the project root.
    Doc,
}

impl ArtifactKind {
    /// Stable string tag used in events and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Src => "src",
            ArtifactKind::Test => "test",
            ArtifactKind::Doc => "doc",
        }
    }
}

/// One artifact pulled out of an agent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// Path relative to the project root.  Guaranteed not to escape it.
    pub relative_path: String,
    /// Raw block body with the fences stripped; no whitespace normalization.
    pub contents: String,
    /// Source / test / doc classification.
    pub kind: ArtifactKind,
}

/// Scan `text` for fenced code blocks and return one [`ExtractedFile`] per
/// well-formed block.  Unmatched fences and blocks whose inferred path would
/// escape the project root are skipped.
pub fn extract(text: &str) -> Vec<ExtractedFile> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    let mut seq = 0usize;
    let mut i = 0usize;

    while i < lines.len() {
        let lang = match parse_fence_open(lines[i]) {
            Some(lang) => lang,
            None => {
                i += 1;
                continue;
            }
        };

        let mut close = None;
        for (offset, line) in lines[i + 1..].iter().enumerate() {
            if is_fence_close(line) {
                close = Some(i + 1 + offset);
                break;
            }
        }
        let end = match close {
            // An unmatched fence swallows the rest of the text; skip it.
            Some(end) => end,
            None => break,
        };

        seq += 1;
        let body_lines = &lines[i + 1..end];
        let contents = join_body(body_lines);

        let hint = if i > 0 {
            parse_hint_line(lines[i - 1], false)
        } else {
            None
        }
        .or_else(|| {
            body_lines
                .first()
                .and_then(|line| parse_hint_line(line, true))
        });

        let relative_path = match hint {
            Some(path) => path,
            None => infer_path(&lang, body_lines, seq),
        };

        if let Some(relative_path) = sanitize_relative_path(&relative_path) {
            let kind = classify(&relative_path, &contents);
            out.push(ExtractedFile {
                relative_path,
                contents,
                kind,
            });
        } else if log::log_enabled!(log::Level::Warn) {
            log::warn!(
                "crewforge::extractor: dropping block with unsafe path '{}'",
                relative_path
            );
        }

        i = end + 1;
    }

    out
}

/// Decide src/test/doc for a path + contents pair.  Exposed so the project
/// store and tests agree with the extractor on placement.
pub fn classify(relative_path: &str, contents: &str) -> ArtifactKind {
    let lowered = relative_path.to_ascii_lowercase();
    if lowered.ends_with(".md") || lowered.ends_with(".rst") || lowered.ends_with(".txt") {
        return ArtifactKind::Doc;
    }

    let file_name = lowered.rsplit('/').next().unwrap_or(&lowered);
    let stem = file_name.split('.').next().unwrap_or(file_name);
    let under_tests = lowered.starts_with("tests/") || lowered.contains("/tests/");
    if under_tests || stem.starts_with("test_") || stem.ends_with("_test") {
        return ArtifactKind::Test;
    }

    let extension = file_name.rsplit('.').next().unwrap_or("");
    if has_test_framework_import(extension, contents) {
        return ArtifactKind::Test;
    }

    ArtifactKind::Src
}

fn has_test_framework_import(extension: &str, contents: &str) -> bool {
    let markers: &[&str] = match extension {
        "py" => &["import pytest", "from pytest", "import unittest", "from unittest"],
        "rs" => &["#[test]", "#[tokio::test]"],
        "js" | "ts" => &[
            "from 'jest'",
            "from \"jest\"",
            "require('jest",
            "from 'vitest'",
            "from \"vitest\"",
            "from 'mocha'",
            "from 'chai'",
        ],
        "go" => &["\"testing\""],
        "java" => &["import org.junit"],
        _ => return false,
    };
    markers.iter().any(|m| contents.contains(m))
}

/// A fence opens on a line of ``` followed by an optional language tag.
fn parse_fence_open(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("```")?;
    if rest.contains('`') {
        return None;
    }
    let tag = rest.split_whitespace().next().unwrap_or("");
    Some(tag.to_ascii_lowercase())
}

/// A fence closes on a line of only ```.
fn is_fence_close(line: &str) -> bool {
    line.trim() == "```"
}

/// Join body lines back into file contents, preserving interior whitespace.
fn join_body(body_lines: &[&str]) -> String {
    if body_lines.is_empty() {
        return String::new();
    }
    let mut contents = body_lines.join("\n");
    contents.push('\n');
    contents
}

/// Parse a file-path hint out of a single line.
///
/// `labelled_only` is set for lines *inside* the block, where a bare token
/// like `config.yml` would be indistinguishable from code: those must carry
/// both a comment marker and a `path:`/`file:`/`filename:` label.
fn parse_hint_line(line: &str, labelled_only: bool) -> Option<String> {
    let mut rest = line.trim();
    if rest.is_empty() {
        return None;
    }

    let mut had_marker = false;
    for marker in &["#", "//", "--", "<!--"] {
        if let Some(stripped) = rest.strip_prefix(marker) {
            rest = stripped.trim_start().trim_end_matches("-->").trim_end();
            had_marker = true;
            break;
        }
    }

    let mut had_label = false;
    let lowered = rest.to_ascii_lowercase();
    for label in &["path:", "filename:", "file:"] {
        if lowered.starts_with(label) {
            rest = rest[label.len()..].trim_start();
            had_label = true;
            break;
        }
    }

    if labelled_only && !(had_marker && had_label) {
        return None;
    }

    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return None;
    }

    let candidate = rest.replace('\\', "/");
    let path_charset = candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':'));
    let file_name = candidate.rsplit('/').next().unwrap_or("");
    let has_extension = file_name.contains('.') && !file_name.ends_with('.');
    if !path_charset || !has_extension {
        return None;
    }
    // A bare line before the fence still needs to look path-like; a comment
    // marker or label is enough to accept a plain file name.
    if !had_marker && !had_label && !candidate.contains('/') {
        return None;
    }
    Some(candidate)
}

/// Build a path from the fence language tag and the first symbol-like token.
fn infer_path(lang: &str, body_lines: &[&str], seq: usize) -> String {
    let extension = extension_for_lang(lang);
    let stem = first_symbol_token(body_lines).unwrap_or_else(|| format!("block_{}", seq));
    format!("{}.{}", stem, extension)
}

fn extension_for_lang(lang: &str) -> &'static str {
    match lang {
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "typescript" | "ts" => "ts",
        "javascript" | "js" => "js",
        "go" | "golang" => "go",
        "java" => "java",
        "c" => "c",
        "cpp" | "c++" => "cpp",
        "csharp" | "cs" => "cs",
        "ruby" | "rb" => "rb",
        "bash" | "sh" | "shell" => "sh",
        "markdown" | "md" => "md",
        "json" => "json",
        "yaml" | "yml" => "yml",
        "toml" => "toml",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        _ => "txt",
    }
}

/// First identifier following a declaration keyword anywhere in the block.
fn first_symbol_token(body_lines: &[&str]) -> Option<String> {
    const KEYWORDS: &[&str] = &[
        "def", "class", "fn", "func", "function", "struct", "trait", "interface", "impl",
    ];
    for line in body_lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for (idx, token) in tokens.iter().enumerate() {
            if KEYWORDS.contains(token) {
                if let Some(next) = tokens.get(idx + 1) {
                    let ident: String = next
                        .chars()
                        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                        .collect();
                    if !ident.is_empty() {
                        return Some(ident.to_ascii_lowercase());
                    }
                }
            }
        }
    }
    None
}

/// Validate that a candidate path stays strictly beneath the project root.
///
/// Returns the normalized path, or `None` for absolute paths, drive letters,
/// parent-directory components, and control characters.
pub fn sanitize_relative_path(candidate: &str) -> Option<String> {
    let normalized = candidate.replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return None;
    }
    // Drive letters ("C:...") and other colon forms are rejected outright.
    if normalized.contains(':') {
        return None;
    }
    if normalized.chars().any(|c| c.is_control()) {
        return None;
    }
    for component in normalized.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return None;
        }
    }
    Some(normalized)
}
