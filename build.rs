use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources. Nothing else in the
// checkout is scanned.
const SOURCE_DIRS: [&str; 4] = ["integrate", "cli", "tests", "benches"];

const FORBIDDEN_MARKERS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

// Collects underscore-prefixed identifiers found in code (not comments or strings).
struct UnderscoreCollector {
    violations: Vec<String>,
}

// Collects comments carrying a forbidden marker word or a `**` outside doc comments.
struct ForbiddenCommentCollector {
    violations: Vec<String>,
    check_stars_in_doc_comments: bool,
}

// Collects comments whose alphabetic characters are all uppercase.
struct UppercaseCommentCollector {
    violations: Vec<String>,
}

// Collects every matched line unfiltered.
struct LineCollector {
    violations: Vec<String>,
}

fn matched_line(mat: &SinkMatch) -> (u64, String) {
    let line_number = mat.line_number().unwrap_or(0);
    let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end().to_string();
    (line_number, line_text)
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

impl Sink for UnderscoreCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let (line_number, line_text) = matched_line(mat);
        if line_text.trim_start().starts_with("//") {
            return Ok(true);
        }

        // Odd-indexed pieces of a quote split sit inside string literals.
        let in_string = line_text
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'));
        if !in_string {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

impl Sink for ForbiddenCommentCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let (line_number, line_text) = matched_line(mat);
        let has_marker = FORBIDDEN_MARKERS.iter().any(|m| line_text.contains(m));
        if !self.check_stars_in_doc_comments
            && is_doc_comment(&line_text)
            && line_text.contains("**")
            && !has_marker
        {
            return Ok(true);
        }
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

impl Sink for UppercaseCommentCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let (line_number, line_text) = matched_line(mat);
        if !is_comment(&line_text) {
            return Ok(true);
        }

        let trimmed = line_text.trim_start();
        let comment_text = if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
            rest.trim()
        } else if let Some(rest) = trimmed.strip_prefix("//") {
            rest.trim()
        } else if let Some(idx) = line_text.find("/*") {
            let rest = &line_text[idx + 2..];
            match rest.find("*/") {
                Some(end) => rest[..end].trim(),
                None => rest.trim(),
            }
        } else {
            return Ok(true);
        };

        let mut alphabetic = comment_text.chars().filter(|c| c.is_alphabetic()).peekable();
        if alphabetic.peek().is_some() && alphabetic.all(char::is_uppercase) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let (line_number, line_text) = matched_line(mat);
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn report(path: &Path, violations: &[String], headline: &str, advice: &[&str]) -> Result<(), Box<dyn Error>> {
    if violations.is_empty() {
        return Ok(());
    }
    let mut error_msg = format!(
        "\n❌ ERROR: Found {} {headline} in {}:\n",
        violations.len(),
        path.display()
    );
    for violation in violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push('\n');
    for line in advice {
        error_msg.push_str(&format!("⚠️ {line}\n"));
    }
    Err(error_msg.into())
}

fn scan_for_underscore_prefixes(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(r"\b(_[a-zA-Z0-9_]+)\b")?;
    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = UnderscoreCollector { violations: Vec::new() };
        searcher.search_path(&matcher, path, &mut collector)?;
        report(
            path,
            &collector.violations,
            "underscore-prefixed identifiers",
            &[
                "Underscore-prefixed names are not allowed in this project.",
                "Either use the binding (dropping the underscore) or remove it completely.",
            ],
        )?;
    }
    Ok(())
}

fn scan_for_forbidden_comment_patterns(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let markers = FORBIDDEN_MARKERS.join("|");
    let marker_matcher = RegexMatcher::new_line_matcher(&format!(r"(//|/\*).*(?:{markers})"))?;
    let stars_matcher = RegexMatcher::new_line_matcher(r"(//|/\*).*\*\*")?;
    let comment_matcher = RegexMatcher::new_line_matcher(r"(//|/\*).*")?;
    let mut searcher = Searcher::new();

    for path in sources {
        let mut markers_found = ForbiddenCommentCollector {
            violations: Vec::new(),
            check_stars_in_doc_comments: true,
        };
        searcher.search_path(&marker_matcher, path, &mut markers_found)?;

        let mut stars_found = ForbiddenCommentCollector {
            violations: Vec::new(),
            check_stars_in_doc_comments: false,
        };
        searcher.search_path(&stars_matcher, path, &mut stars_found)?;

        let mut violations = markers_found.violations;
        violations.extend(stars_found.violations);
        report(
            path,
            &violations,
            "forbidden comment patterns",
            &[
                &format!("Comments containing {} are not allowed.", FORBIDDEN_MARKERS.join(", ")),
                "The '**' pattern is only allowed in doc comments.",
                "Remove these comments rather than commenting them out.",
            ],
        )?;

        let mut uppercase = UppercaseCommentCollector { violations: Vec::new() };
        searcher.search_path(&comment_matcher, path, &mut uppercase)?;
        report(
            path,
            &uppercase.violations,
            "all-uppercase comments",
            &["Comments whose alphabetic characters are all uppercase are not allowed."],
        )?;
    }
    Ok(())
}

fn scan_for_allow_dead_code(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]")?;
    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = LineCollector { violations: Vec::new() };
        searcher.search_path(&matcher, path, &mut collector)?;
        report(
            path,
            &collector.violations,
            "#[allow(dead_code)] attributes",
            &["Either use the code or remove it; silencing the lint is not allowed."],
        )?;
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    let checks: [fn(&[PathBuf]) -> Result<(), Box<dyn Error>>; 3] = [
        scan_for_underscore_prefixes,
        scan_for_forbidden_comment_patterns,
        scan_for_allow_dead_code,
    ];
    for check in checks {
        if let Err(e) = check(&sources) {
            // eprintln so the message shows up in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
