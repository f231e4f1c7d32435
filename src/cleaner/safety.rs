use std::env;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use lazy_static::lazy_static;
use log::warn;

/// Paths no rule may ever delete, regardless of what a rule file says.
const CRITICAL_PATTERNS: &[&str] = &[
    // Filesystem and drive roots
    "/",
    "?:/",
    // Windows system
    "?:/windows",
    "?:/windows/system32",
    "?:/windows/system32/*",
    "?:/windows/syswow64",
    "?:/windows/syswow64/*",
    "?:/windows/winsxs",
    "?:/windows/winsxs/*",
    // Bootloader
    "?:/boot",
    "?:/boot/*",
    "?:/bootmgr",
    "/boot",
    "/boot/*",
    // Unix binaries and libraries
    "/bin",
    "/bin/*",
    "/sbin",
    "/sbin/*",
    "/usr/bin",
    "/usr/bin/*",
    "/usr/sbin",
    "/usr/sbin/*",
    "/usr/lib",
    "/usr/lib/*",
    // macOS system
    "/system",
    "/system/library/*",
];

lazy_static! {
    static ref SYSTEM_WHITELIST: Whitelist = Whitelist::system();
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Fixed set of protected path patterns.
#[derive(Debug, Clone)]
pub struct Whitelist {
    patterns: Vec<Pattern>,
}

impl Whitelist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| {
                let normalized = raw.as_ref().replace('\\', "/").to_lowercase();
                match Pattern::new(&normalized) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!("Dropping invalid whitelist pattern {}: {}", raw.as_ref(), e);
                        None
                    }
                }
            })
            .collect();
        Whitelist { patterns }
    }

    /// OS-critical directories plus the user's home directory itself.
    pub fn system() -> Self {
        let mut whitelist = Whitelist::new(CRITICAL_PATTERNS);
        if let Some(home) = dirs::home_dir() {
            let home = normalize(&home.to_string_lossy());
            if let Ok(p) = Pattern::new(&Pattern::escape(&home)) {
                whitelist.patterns.push(p);
            }
        }
        whitelist
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        let candidate = normalize(&path.to_string_lossy());
        if candidate.is_empty() {
            // Unresolvable input, refuse it
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.matches_with(&candidate, MATCH_OPTIONS))
    }
}

/// Shared instance used by the engine.
pub fn system_whitelist() -> &'static Whitelist {
    &SYSTEM_WHITELIST
}

/// Lexically absolute, `/`-separated, lowercase, `.`/`..` resolved.
fn normalize(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let is_drive = has_drive_prefix(&unified);
    let absolute = if unified.starts_with('/') || is_drive {
        unified
    } else {
        match env::current_dir() {
            Ok(cwd) => format!("{}/{}", cwd.to_string_lossy().replace('\\', "/"), unified),
            Err(_) => return String::new(),
        }
    };

    let (prefix, rest) = if has_drive_prefix(&absolute) {
        (absolute[..2].to_string(), &absolute[2..])
    } else {
        (String::new(), absolute.as_str())
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    format!("{}/{}", prefix, segments.join("/")).to_lowercase()
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn system_binaries_are_protected() {
        let wl = Whitelist::new(CRITICAL_PATTERNS);
        assert!(wl.is_protected(Path::new("/usr/bin/ls")));
        assert!(wl.is_protected(Path::new("/usr/bin")));
        assert!(wl.is_protected(Path::new("/boot/vmlinuz")));
        assert!(wl.is_protected(Path::new("/")));
    }

    #[test]
    fn lookalike_paths_are_not_protected() {
        let wl = Whitelist::new(CRITICAL_PATTERNS);
        assert!(!wl.is_protected(Path::new("/usr/binaries/tool")));
        assert!(!wl.is_protected(Path::new("/tmp/usr/bin/ls")));
        assert!(!wl.is_protected(Path::new("/home/u/.cache/chrome/Cache/f_000001")));
    }

    #[test]
    fn windows_paths_match_case_insensitively() {
        let wl = Whitelist::new(CRITICAL_PATTERNS);
        assert!(wl.is_protected(Path::new(r"C:\Windows\System32\drivers\etc\hosts")));
        assert!(wl.is_protected(Path::new(r"c:\WINDOWS\WinSxS")));
        assert!(wl.is_protected(Path::new(r"D:\")));
        assert!(!wl.is_protected(Path::new(
            r"C:\Users\me\AppData\Local\Google\Chrome\User Data\Default\Cookies"
        )));
    }

    #[test]
    fn dot_segments_cannot_escape_protection() {
        let wl = Whitelist::new(CRITICAL_PATTERNS);
        assert!(wl.is_protected(Path::new("/home/u/.cache/../../../usr/bin/ls")));
        assert!(wl.is_protected(Path::new("/usr/./sbin/./init")));
    }

    #[test]
    fn home_directory_itself_is_protected() {
        if let Some(home) = dirs::home_dir() {
            let wl = Whitelist::system();
            assert!(wl.is_protected(&home));
            assert!(!wl.is_protected(&home.join(".cache/some-browser/Cache")));
        }
    }

    #[test]
    fn custom_patterns() {
        let wl = Whitelist::new(&["/data/keep/*"]);
        assert!(wl.is_protected(&PathBuf::from("/data/keep/a/b")));
        assert!(!wl.is_protected(&PathBuf::from("/data/drop/a")));
    }
}
