use serde::{Deserialize, Serialize};

/// Host platform as seen by rule files' `os` attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Linux,
    Darwin,
    FreeBsd,
    OpenBsd,
    NetBsd,
    Other(String),
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else if cfg!(target_os = "openbsd") {
            Platform::OpenBsd
        } else if cfg!(target_os = "netbsd") {
            Platform::NetBsd
        } else {
            Platform::Other(std::env::consts::OS.to_string())
        }
    }

    /// Family names this platform answers to.
    pub fn families(&self) -> Vec<&str> {
        match self {
            Platform::Windows => vec!["windows"],
            Platform::Linux => vec!["linux", "unix"],
            Platform::Darwin => vec!["darwin", "bsd", "unix"],
            Platform::FreeBsd => vec!["bsd", "freebsd", "unix"],
            Platform::OpenBsd => vec!["bsd", "openbsd", "unix"],
            Platform::NetBsd => vec!["bsd", "netbsd", "unix"],
            Platform::Other(name) => vec![name.as_str()],
        }
    }

    /// An empty `os` attribute matches every platform.
    pub fn matches(&self, os_attr: &str) -> bool {
        let wanted = os_attr.trim();
        if wanted.is_empty() {
            return true;
        }
        self.families()
            .iter()
            .any(|family| family.eq_ignore_ascii_case(wanted))
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Platform::Windows)
    }
}
