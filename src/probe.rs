use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::catalog::{self, BrowserSpec};
use crate::cleaner::{PathResolver, Platform};

/// What the probe knows about one candidate browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: String,
    pub present: bool,
    pub running: bool,
    /// Where presence was established (a profile directory), if anywhere.
    pub source: Option<String>,
}

/// Installed-program detection, kept behind a trait so runs can be tested
/// without real browsers.
pub trait ProgramProbe: Send + Sync {
    fn probe(&self, name: &str) -> ProgramInfo;
}

/// Lowercased names of the processes alive when the snapshot was taken.
#[derive(Clone, Default)]
pub struct ProcessSnapshot {
    process_names: Arc<HashSet<String>>,
}

impl ProcessSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ProcessSnapshot {
            process_names: Arc::new(names.into_iter().map(|n| n.as_ref().to_lowercase()).collect()),
        }
    }

    pub fn has_process_named(&self, name: &str) -> bool {
        self.process_names.contains(&name.to_lowercase())
    }

    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_processes();

        let names: HashSet<String> = system
            .processes()
            .values()
            .map(|process| process.name().to_lowercase())
            .collect();
        debug!("Captured {} running process names", names.len());

        ProcessSnapshot {
            process_names: Arc::new(names),
        }
    }
}

/// Probes the real machine: profile directories through the path resolver,
/// running state through a process snapshot taken per call.
pub struct SystemProbe {
    resolver: PathResolver,
    platform: Platform,
}

impl SystemProbe {
    pub fn new() -> Self {
        SystemProbe {
            resolver: PathResolver::new(),
            platform: Platform::current(),
        }
    }

    pub fn with_resolver(resolver: PathResolver, platform: Platform) -> Self {
        SystemProbe { resolver, platform }
    }

    fn locate(&self, spec: &BrowserSpec) -> Option<String> {
        spec.profile_roots_for(&self.platform)
            .into_iter()
            .flat_map(|pattern| self.resolver.expand(pattern))
            .next()
            .map(|p| p.to_string_lossy().into_owned())
    }

    pub fn probe_with(&self, name: &str, snapshot: &ProcessSnapshot) -> ProgramInfo {
        let spec = match catalog::find(name) {
            Some(spec) => spec,
            None => {
                debug!("No catalog entry for {}", name);
                return ProgramInfo {
                    name: name.to_string(),
                    present: false,
                    running: false,
                    source: None,
                };
            }
        };
        let source = self.locate(spec);
        let running = spec
            .process_names
            .iter()
            .any(|p| snapshot.has_process_named(p));
        ProgramInfo {
            name: spec.id.to_string(),
            present: source.is_some(),
            running,
            source,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramProbe for SystemProbe {
    fn probe(&self, name: &str) -> ProgramInfo {
        self.probe_with(name, &ProcessSnapshot::capture())
    }
}
