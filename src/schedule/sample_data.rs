// Dummy browser data for dev-mode runs. Scheduled runs in dev mode only
// count these files; nothing here is ever deleted by a run.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use log::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::Result;

const DEFAULT_MIN_SIZE: u64 = 1024;
const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub enum SampleFile {
    /// Same name every time; repeats get a `.N` suffix.
    Fixed(&'static str),
    /// Prefix followed by a zero-padded decimal counter.
    Counter(&'static str),
    /// Prefix followed by an 8-digit uppercase hex counter.
    Hex(&'static str),
}

impl SampleFile {
    fn render(&self, n: usize) -> String {
        match self {
            SampleFile::Fixed(path) if n == 0 => path.to_string(),
            SampleFile::Fixed(path) => format!("{}.{}", path, n),
            SampleFile::Counter(prefix) => format!("{}{:06}", prefix, n),
            SampleFile::Hex(prefix) => format!("{}{:08X}", prefix, n),
        }
    }
}

#[derive(Debug)]
pub struct SampleLayout {
    pub browser: &'static str,
    pub files: &'static [SampleFile],
    /// Inclusive range of files to generate.
    pub count: (usize, usize),
}

const CHROMIUM_FILES: &[SampleFile] = &[
    SampleFile::Counter("Cache/f_"),
    SampleFile::Counter("GPUCache/data_"),
    SampleFile::Fixed("Cookies"),
    SampleFile::Fixed("History"),
];

pub static SAMPLE_LAYOUTS: &[SampleLayout] = &[
    SampleLayout {
        browser: "chrome",
        files: &[
            SampleFile::Counter("Cache/f_"),
            SampleFile::Counter("Cache/data_"),
            SampleFile::Fixed("Code Cache/js/index-dir/the-real-index"),
            SampleFile::Counter("GPUCache/data_"),
            SampleFile::Fixed("Cookies"),
            SampleFile::Fixed("History"),
            SampleFile::Fixed("Login Data"),
            SampleFile::Fixed("Web Data"),
        ],
        count: (100, 150),
    },
    SampleLayout {
        browser: "firefox",
        files: &[
            SampleFile::Hex("cache2/entries/"),
            SampleFile::Fixed("cookies.sqlite"),
            SampleFile::Fixed("places.sqlite"),
            SampleFile::Fixed("formhistory.sqlite"),
            SampleFile::Fixed("logins.json"),
        ],
        count: (80, 120),
    },
    SampleLayout {
        browser: "edge",
        files: CHROMIUM_FILES,
        count: (70, 100),
    },
    SampleLayout {
        browser: "brave",
        files: CHROMIUM_FILES,
        count: (60, 90),
    },
    SampleLayout {
        browser: "opera",
        files: CHROMIUM_FILES,
        count: (50, 80),
    },
    SampleLayout {
        browser: "whale",
        files: CHROMIUM_FILES,
        count: (50, 80),
    },
    SampleLayout {
        browser: "safari",
        files: &[
            SampleFile::Fixed("Cache.db"),
            SampleFile::Fixed("Cookies/Cookies.binarycookies"),
            SampleFile::Fixed("History.db"),
        ],
        count: (40, 70),
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub per_browser: BTreeMap<String, usize>,
    pub total_files: usize,
    pub total_size: u64,
}

/// Where a browser's sample files live under `root`.
pub fn sample_dir(root: &Path, browser: &str) -> PathBuf {
    root.join(browser.trim().to_lowercase())
}

/// Regular files (and their total size) under a browser's sample directory.
/// A missing directory counts as empty.
pub fn count_files(root: &Path, browser: &str) -> (usize, u64) {
    let dir = sample_dir(root, browser);
    if !dir.is_dir() {
        debug!("[dev] No sample data at {}", dir.display());
        return (0, 0);
    }
    WalkDir::new(&dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(count, size), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, size + len)
        })
}

#[derive(Debug, Clone)]
pub struct SampleDataGenerator {
    root: PathBuf,
    size_range: (u64, u64),
}

impl SampleDataGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SampleDataGenerator {
            root: root.into(),
            size_range: (DEFAULT_MIN_SIZE, DEFAULT_MAX_SIZE),
        }
    }

    pub fn with_size_range(mut self, min: u64, max: u64) -> Self {
        self.size_range = (min.min(max), max.max(min));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when any browser directory holds at least one file.
    pub fn exists(&self) -> bool {
        SAMPLE_LAYOUTS
            .iter()
            .any(|layout| count_files(&self.root, layout.browser).0 > 0)
    }

    /// Generates sample files for every known browser. Returns `None` when
    /// data already exists and `force` is not set.
    pub fn generate(&self, force: bool) -> Result<Option<SampleStats>> {
        if !force && self.exists() {
            info!("[dev] Sample data already present in {}", self.root.display());
            return Ok(None);
        }
        if force {
            self.clean()?;
        }
        fs::create_dir_all(&self.root)?;

        let mut stats = SampleStats::default();
        for layout in SAMPLE_LAYOUTS {
            let wanted = random_in(layout.count.0 as u64, layout.count.1 as u64) as usize;
            let written = self.generate_browser(layout, wanted)?;
            info!("[dev] {}: {} files", layout.browser, written);
            stats.per_browser.insert(layout.browser.to_string(), written);
            stats.total_files += written;
            stats.total_size += count_files(&self.root, layout.browser).1;
        }

        info!(
            "[dev] Generated {} sample files ({})",
            stats.total_files,
            ByteSize(stats.total_size)
        );
        Ok(Some(stats))
    }

    /// Writes `count` files for one browser; individual write failures are
    /// logged and skipped.
    pub fn generate_browser(&self, layout: &SampleLayout, count: usize) -> Result<usize> {
        let dir = sample_dir(&self.root, layout.browser);
        fs::create_dir_all(&dir)?;

        let mut written = 0;
        for n in 0..count {
            let pick = random_in(0, layout.files.len().saturating_sub(1) as u64) as usize;
            let Some(template) = layout.files.get(pick) else {
                continue;
            };
            let path = dir.join(template.render(n));
            match self.write_file(&path) {
                Ok(()) => written += 1,
                Err(e) => warn!("[dev] Failed to write {}: {}", path.display(), e),
            }
        }
        Ok(written)
    }

    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn write_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        file.set_len(random_in(self.size_range.0, self.size_range.1))
    }
}

fn random_in(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    let span = (max - min) as u128 + 1;
    min + (Uuid::new_v4().as_u128() % span) as u64
}
