// src/catalog.rs

use std::path::{Path, PathBuf};

use crate::cleaner::Platform;

/// Options every scheduled run cleans.
pub const DEFAULT_OPTIONS: &[&str] = &["cookies", "history", "session", "passwords", "form_history"];
pub const BOOKMARK_OPTIONS: &[&str] = &["bookmarks", "favicons"];
pub const DOWNLOAD_OPTIONS: &[&str] = &["download_history"];
/// Never selected: removing these breaks the browser profile.
pub const EXCLUDED_OPTIONS: &[&str] = &["extensions", "settings", "preferences"];

#[derive(Debug)]
pub struct BrowserSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub rule_file: &'static str,
    /// Lowercase executable names across platforms.
    pub process_names: &'static [&'static str],
    /// (os family, pattern) pairs; a match means the browser is installed.
    pub profile_roots: &'static [(&'static str, &'static str)],
}

impl BrowserSpec {
    pub fn profile_roots_for(&self, platform: &Platform) -> Vec<&'static str> {
        self.profile_roots
            .iter()
            .filter(|(os, _)| platform.matches(os))
            .map(|(_, pattern)| *pattern)
            .collect()
    }

    pub fn rule_path(&self, rules_dir: &Path) -> PathBuf {
        rules_dir.join(self.rule_file)
    }
}

pub static BROWSERS: &[BrowserSpec] = &[
    BrowserSpec {
        id: "chrome",
        display_name: "Chrome",
        rule_file: "google_chrome.xml",
        process_names: &["chrome.exe", "chromium.exe", "chrome", "chromium", "google chrome"],
        profile_roots: &[
            ("windows", r"%LocalAppData%\Google\Chrome\User Data"),
            ("linux", "~/.config/google-chrome"),
            ("darwin", "~/Library/Application Support/Google/Chrome"),
        ],
    },
    BrowserSpec {
        id: "edge",
        display_name: "Edge",
        rule_file: "microsoft_edge.xml",
        process_names: &["msedge.exe", "msedge", "microsoft edge"],
        profile_roots: &[
            ("windows", r"%LocalAppData%\Microsoft\Edge\User Data"),
            ("linux", "~/.config/microsoft-edge"),
            ("darwin", "~/Library/Application Support/Microsoft Edge"),
        ],
    },
    BrowserSpec {
        id: "firefox",
        display_name: "Firefox",
        rule_file: "firefox.xml",
        process_names: &["firefox.exe", "firefox", "firefox-bin"],
        profile_roots: &[
            ("windows", r"%AppData%\Mozilla\Firefox\Profiles"),
            ("linux", "~/.mozilla/firefox"),
            ("darwin", "~/Library/Application Support/Firefox/Profiles"),
        ],
    },
    BrowserSpec {
        id: "brave",
        display_name: "Brave",
        rule_file: "brave.xml",
        process_names: &["brave.exe", "brave", "brave browser"],
        profile_roots: &[
            ("windows", r"%LocalAppData%\BraveSoftware\Brave-Browser\User Data"),
            ("linux", "~/.config/BraveSoftware/Brave-Browser"),
            ("darwin", "~/Library/Application Support/BraveSoftware/Brave-Browser"),
        ],
    },
    BrowserSpec {
        id: "opera",
        display_name: "Opera",
        rule_file: "opera.xml",
        process_names: &["opera.exe", "opera"],
        profile_roots: &[
            ("windows", r"%AppData%\Opera Software\Opera Stable"),
            ("linux", "~/.config/opera"),
            ("darwin", "~/Library/Application Support/com.operasoftware.Opera"),
        ],
    },
    BrowserSpec {
        id: "whale",
        display_name: "Whale",
        rule_file: "whale.xml",
        process_names: &["whale.exe", "whale", "naver-whale"],
        profile_roots: &[
            ("windows", r"%LocalAppData%\Naver\Naver Whale\User Data"),
            ("linux", "~/.config/naver-whale"),
            ("darwin", "~/Library/Application Support/Naver/Whale"),
        ],
    },
    BrowserSpec {
        id: "safari",
        display_name: "Safari",
        rule_file: "safari.xml",
        process_names: &["safari", "safari.exe"],
        profile_roots: &[("darwin", "~/Library/Safari")],
    },
];

/// Looks a browser up by id or display name, ignoring case.
pub fn find(name: &str) -> Option<&'static BrowserSpec> {
    let wanted = name.trim();
    BROWSERS
        .iter()
        .find(|b| b.id.eq_ignore_ascii_case(wanted) || b.display_name.eq_ignore_ascii_case(wanted))
}

pub fn display_name(name: &str) -> String {
    find(name)
        .map(|b| b.display_name.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Option ids a scenario selects.
pub fn cleaner_options(delete_bookmarks: bool, delete_downloads: bool) -> Vec<&'static str> {
    let mut options = DEFAULT_OPTIONS.to_vec();
    if delete_bookmarks {
        options.extend_from_slice(BOOKMARK_OPTIONS);
    }
    if delete_downloads {
        options.extend_from_slice(DOWNLOAD_OPTIONS);
    }
    options.retain(|id| !EXCLUDED_OPTIONS.contains(id));
    options
}
