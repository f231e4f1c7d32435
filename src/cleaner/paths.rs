use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fs;
use std::path::PathBuf;

use glob::MatchOptions;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::{Captures, Regex};

lazy_static! {
    static ref VAR_RE: Regex = Regex::new(
        r"%(?P<pct>[A-Za-z_][A-Za-z0-9_()]*)%|\$\{(?P<brace>[A-Za-z_][A-Za-z0-9_]*)\}|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)"
    )
    .expect("variable pattern");
    static ref PROGRAM_FILES_RE: Regex =
        Regex::new(r"(?i)^%ProgramFiles%").expect("program files pattern");
    static ref COMMON_PROGRAM_FILES_RE: Regex =
        Regex::new(r"(?i)^%CommonProgramFiles%").expect("common program files pattern");
}

const WILDCARDS: &[char] = &['*', '?', '['];

/// Turns rule path patterns into concrete, existing filesystem paths.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    overrides: HashMap<String, String>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables consulted before the process environment.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        PathResolver {
            overrides: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Expand variables and wildcards; returns existing paths only, sorted.
    pub fn expand(&self, pattern: &str) -> Vec<PathBuf> {
        let mut found = BTreeSet::new();
        for expanded in self.expand_variants(pattern) {
            for path in self.search(&expanded) {
                found.insert(path);
            }
        }
        found.into_iter().collect()
    }

    /// Variable-expanded strings for a pattern, including the 64-bit
    /// program-files variant when the pattern names one.
    pub fn expand_variants(&self, pattern: &str) -> Vec<String> {
        let mut variants = vec![self.expand_vars(pattern)];

        let redirected = if PROGRAM_FILES_RE.is_match(pattern) {
            Some(PROGRAM_FILES_RE.replace(pattern, "%ProgramW6432%").into_owned())
        } else if COMMON_PROGRAM_FILES_RE.is_match(pattern) {
            Some(
                COMMON_PROGRAM_FILES_RE
                    .replace(pattern, "%CommonProgramW6432%")
                    .into_owned(),
            )
        } else {
            None
        };

        if let Some(alt) = redirected {
            let alt = self.expand_vars(&alt);
            if !variants.contains(&alt) {
                variants.push(alt);
            }
        }
        variants
    }

    /// `%VAR%`, `${VAR}` and `$VAR`; unknown names stay verbatim. A leading
    /// `~` becomes the home directory (a `HOME` override wins).
    pub fn expand_vars(&self, input: &str) -> String {
        let replaced = VAR_RE.replace_all(input, |caps: &Captures| {
            let name = caps
                .name("pct")
                .or_else(|| caps.name("brace"))
                .or_else(|| caps.name("bare"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            self.lookup(name)
                .unwrap_or_else(|| caps[0].to_string())
        });
        let home = self
            .overrides
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("HOME"))
            .map(|(_, value)| PathBuf::from(value))
            .or_else(dirs::home_dir);
        expand_home(&replaced, home)
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(name) {
            return Some(value.clone());
        }
        if let Some((_, value)) = self
            .overrides
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            return Some(value.clone());
        }
        env::var(name).ok()
    }

    fn search(&self, expanded: &str) -> Vec<PathBuf> {
        if expanded.contains(WILDCARDS) {
            return glob_existing(expanded);
        }
        let path = PathBuf::from(expanded);
        if fs::symlink_metadata(&path).is_ok() {
            vec![path]
        } else {
            Vec::new()
        }
    }
}

fn expand_home(input: &str, home: Option<PathBuf>) -> String {
    let rest = if input == "~" {
        Some("")
    } else if input.starts_with("~/") || input.starts_with("~\\") {
        Some(&input[2..])
    } else {
        None
    };
    match (rest, home) {
        (Some(rest), Some(home)) if rest.is_empty() => home.to_string_lossy().into_owned(),
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => input.to_string(),
    }
}

fn glob_existing(pattern: &str) -> Vec<PathBuf> {
    let options = MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    match glob::glob_with(pattern, options) {
        Ok(paths) => paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!("Skipping unreadable glob entry: {}", e);
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!("Invalid glob pattern {}: {}", pattern, e);
            Vec::new()
        }
    }
}
