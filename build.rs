//! Records the build time for `tally version` and holds the crate sources to a
//! few house rules. Any violation fails the build with a list of offending
//! lines.

use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only crate sources are checked; build.rs and the demo data are not.
const POLICED_DIRS: [&str; 3] = ["survey", "cli", "tests"];

struct Rule {
    name: &'static str,
    /// Line-level prefilter handed to the searcher.
    pattern: &'static str,
    /// Decides whether a prefiltered line really breaks the rule.
    applies: fn(&str) -> bool,
    advice: &'static str,
}

const RULES: [Rule; 4] = [
    Rule {
        name: "underscore-prefixed name",
        pattern: r"\b_[a-z][A-Za-z0-9_]*",
        applies: underscore_name_in_code,
        advice: "Use the value, or bind it to `_` when it is ignored on purpose.",
    },
    Rule {
        name: "#[allow(dead_code)]",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        applies: always,
        advice: "Delete the unused code instead of silencing the lint.",
    },
    Rule {
        name: "changelog comment",
        pattern: r"//.*\b(FIX|FIXED|FIXES|CORRECTED|NEW|CHANGE|CHANGED|CHANGES|MODIFIED|UPDATE|UPDATED|UPDATES)\b",
        applies: always,
        advice: "Comments describe the code as it stands, not its history.",
    },
    Rule {
        name: "all-caps comment",
        pattern: r"//",
        applies: all_caps_comment,
        advice: "Write comments in sentence case.",
    },
];

/// Collects the lines of one file that break one rule.
struct Findings<'a> {
    rule: &'a Rule,
    path: &'a Path,
    hits: Vec<String>,
}

impl Sink for Findings<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let text = String::from_utf8_lossy(mat.bytes());
        let text = text.trim_end();
        if (self.rule.applies)(text) {
            self.hits.push(format!(
                "{}:{}: {}",
                self.path.display(),
                mat.line_number().unwrap_or(0),
                text.trim_start()
            ));
        }
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in POLICED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=TALLY_BUILD_TIMESTAMP={timestamp}");

    match check_sources() {
        Ok(report) if report.is_empty() => {}
        Ok(report) => {
            eprintln!("{report}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Source policy check could not run: {e}");
            std::process::exit(1);
        }
    }
}

fn policed_sources() -> Vec<PathBuf> {
    POLICED_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Runs every rule over every source file. Returns an empty string when the
/// sources are clean.
fn check_sources() -> Result<String, Box<dyn Error>> {
    let sources = policed_sources();
    let mut searcher = Searcher::new();
    let mut report = String::new();

    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        let mut hits = Vec::new();
        for path in &sources {
            let mut findings = Findings {
                rule,
                path,
                hits: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut findings)?;
            hits.append(&mut findings.hits);
        }
        if hits.is_empty() {
            continue;
        }
        report.push_str(&format!("\nerror: {} ({} found)\n", rule.name, hits.len()));
        for hit in &hits {
            report.push_str(&format!("  {hit}\n"));
        }
        report.push_str(&format!("  {}\n", rule.advice));
    }
    Ok(report)
}

fn always(_: &str) -> bool {
    true
}

/// The code portion of a line: everything before a `//` comment, with the
/// contents of string literals dropped.
fn code_part(line: &str) -> String {
    let mut code = String::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut previous = ' ';
    for c in line.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                code.push(c);
                previous = c;
            }
            continue;
        }
        if c == '/' && previous == '/' {
            code.pop();
            break;
        }
        if c == '"' {
            in_string = true;
        }
        code.push(c);
        previous = c;
    }
    code
}

fn underscore_name_in_code(line: &str) -> bool {
    let code: Vec<char> = code_part(line).chars().collect();
    code.windows(2).enumerate().any(|(i, pair)| {
        let starts_word = i == 0 || !(code[i - 1].is_alphanumeric() || code[i - 1] == '_');
        starts_word && pair[0] == '_' && pair[1].is_ascii_lowercase()
    })
}

fn all_caps_comment(line: &str) -> bool {
    let Some(start) = line.find("//") else {
        return false;
    };
    let letters: Vec<char> = line[start..]
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}
