//! Snapshot archive lookup.
//!
//! The camera writes snapshots into a calendar tree below the archive
//! root, one directory level per time component:
//!
//! ```text
//! <root>/16/01/30/06/19/58/00001-capture.jpg
//!        yy mm dd hh mm ss
//! ```
//!
//! [`ImageLocator::locate`] maps a time window onto the snapshot files
//! whose modification time falls inside it.  The tree is walked depth
//! first and pruned on the timestamps decoded from the directory names:
//! branches that start after the window are skipped, and of the branches
//! starting before the window only the most recent one is kept, since it
//! is the only one that can hold frames straddling the window start.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::Config;

/// Number of calendar segments of a fully resolved (per-second) directory.
pub const RESOLVED_DEPTH: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{}: expected 1 to 6 calendar segments below the archive root, found {count}", .path.display())]
    SegmentCount { path: PathBuf, count: usize },

    #[error("{}: segment '{segment}' is not a calendar number", .path.display())]
    BadSegment { path: PathBuf, segment: String },

    #[error("{}: does not name a valid calendar time", .path.display())]
    InvalidTime { path: PathBuf },

    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A directory of the calendar tree with its decoded start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarDir {
    pub path: PathBuf,
    /// Earliest instant the directory can cover.
    pub timestamp: DateTime<Utc>,
    /// Number of calendar segments below the archive root.
    pub depth: usize,
}

impl CalendarDir {
    /// Decode `path`, which must lie below `root`.
    ///
    /// The year is stored with two digits and expanded into the 2000s.
    /// Missing month and day default to 1, missing time of day to
    /// midnight.
    pub fn decode(root: &Path, path: &Path) -> Result<Self, ArchiveError> {
        let rel = path.strip_prefix(root).map_err(|_| ArchiveError::SegmentCount {
            path: path.to_path_buf(),
            count: 0,
        })?;

        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if segments.is_empty() || segments.len() > RESOLVED_DEPTH {
            return Err(ArchiveError::SegmentCount {
                path: path.to_path_buf(),
                count: segments.len(),
            });
        }

        let mut parts = [0u32; RESOLVED_DEPTH];
        for (i, segment) in segments.iter().enumerate() {
            let valid = !segment.is_empty()
                && segment.bytes().all(|b| b.is_ascii_digit())
                && (i != 0 || segment.len() == 2);
            let value = if valid { segment.parse::<u32>().ok() } else { None };
            parts[i] = value.ok_or_else(|| ArchiveError::BadSegment {
                path: path.to_path_buf(),
                segment: segment.clone(),
            })?;
        }

        let depth = segments.len();
        let year = 2000 + parts[0] as i32;
        let month = if depth > 1 { parts[1] } else { 1 };
        let day = if depth > 2 { parts[2] } else { 1 };

        let timestamp = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(parts[3], parts[4], parts[5]))
            .ok_or_else(|| ArchiveError::InvalidTime {
                path: path.to_path_buf(),
            })?
            .and_utc();

        Ok(Self {
            path: path.to_path_buf(),
            timestamp,
            depth,
        })
    }

    /// A per-second directory: nothing below it is a calendar level.
    pub fn is_resolved(&self) -> bool {
        self.depth == RESOLVED_DEPTH
    }
}

/// Outcome of the pruned walk over the calendar tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Traversal {
    /// Directories whose snapshot files must be scanned, in walk order.
    pub leaves: Vec<PathBuf>,
    /// Number of directories whose contents were listed.
    pub visited: usize,
}

/// Finds snapshot files inside a time window.
#[derive(Debug, Clone)]
pub struct ImageLocator {
    root: PathBuf,
    extension: String,
}

impl ImageLocator {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.archive_dir, &config.image_ext)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All snapshot files with a modification time in `[start, stop]`.
    ///
    /// Files are ordered by directory walk order, then by file name.
    pub fn locate(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let traversal = self.traverse(start, stop)?;
        info!(
            "Locating pictures between {start} and {stop}: {} director{} below {}",
            traversal.leaves.len(),
            if traversal.leaves.len() == 1 { "y" } else { "ies" },
            self.root.display()
        );
        debug!("Leaf directories: {:?}", traversal.leaves);

        let mut images = Vec::new();
        for dir in &traversal.leaves {
            images.extend(self.scan_leaf(dir, start, stop)?);
        }
        Ok(images)
    }

    /// Walk the tree and return the leaf directories relevant to the window.
    pub fn traverse(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Traversal, ArchiveError> {
        let mut traversal = Traversal::default();
        self.walk(&self.root, start, stop, &mut traversal)?;
        Ok(traversal)
    }

    fn walk(
        &self,
        dir: &Path,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        traversal: &mut Traversal,
    ) -> Result<(), ArchiveError> {
        traversal.visited += 1;

        let mut children = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            if !entry.file_type().map_err(io_error(dir))?.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            children.push(CalendarDir::decode(&self.root, &entry.path())?);
        }

        if children.is_empty() {
            traversal.leaves.push(dir.to_path_buf());
            return Ok(());
        }

        children.sort_by(|a, b| match a.timestamp.cmp(&b.timestamp) {
            Ordering::Equal => a.path.cmp(&b.path),
            other => other,
        });

        let mut selected: Vec<CalendarDir> = Vec::new();
        for child in children {
            if child.timestamp < start {
                // Only the latest directory before the window can hold
                // frames from inside it.
                selected.clear();
            }
            if child.timestamp > stop {
                break;
            }
            selected.push(child);
        }

        for child in selected {
            if child.is_resolved() {
                traversal.leaves.push(child.path);
            } else {
                self.walk(&child.path, start, stop, traversal)?;
            }
        }
        Ok(())
    }

    /// Snapshot files of one leaf directory whose mtime lies in the window.
    fn scan_leaf(
        &self,
        dir: &Path,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let suffix = format!(".{}", self.extension);

        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            if entry.file_type().map_err(io_error(dir))?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&suffix) {
                names.push(name);
            }
        }
        names.sort();

        let mut images = Vec::new();
        for name in names {
            let path = dir.join(&name);
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(io_error(&path))?;
            let mtime = DateTime::<Utc>::from(modified);
            if mtime >= start && mtime <= stop {
                images.push(path);
            }
        }
        Ok(images)
    }
}
