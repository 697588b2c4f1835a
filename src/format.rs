//! Format stamp and feature gating
//!
//! The first line of `format` is a decimal format number; subsequent
//! lines carry `key value` options.  The format number gates which
//! engine features may be used against a repository.

use std::path::Path;

use crate::error::{FsError, Result};
use crate::util;

/// Newest format this engine writes.
pub const FORMAT_NUMBER: u8 = 6;

/// Sharded layout and the `layout` format option.
pub const MIN_LAYOUT_FORMAT_OPTION_FORMAT: u8 = 3;
/// `txn-current` transaction sequence file.
pub const MIN_TXN_CURRENT_FORMAT: u8 = 3;
/// Proto-revisions stored under `txn-protorevs/`.
pub const MIN_PROTOREVS_DIR_FORMAT: u8 = 3;
/// Mergeinfo metadata on node revisions.
pub const MIN_MERGEINFO_FORMAT: u8 = 3;
/// Packed shards and `min-unpacked-rev`.
pub const MIN_PACKED_FORMAT: u8 = 4;
/// Content-addressed representation sharing.
pub const MIN_REP_SHARING_FORMAT: u8 = 4;
/// Transaction-local ids rewritten as `<local>-<rev>`.
pub const MIN_NO_GLOBAL_IDS_FORMAT: u8 = 4;
/// `fsfs.conf` is created and consulted.
pub const MIN_CONFIG_FILE_FORMAT: u8 = 4;
/// Node kinds recorded in changed-path lists.
pub const MIN_KIND_IN_CHANGED_FORMAT: u8 = 4;
/// Packed revision properties.
pub const MIN_PACKED_REVPROP_FORMAT: u8 = 6;
/// Deltification tuning options.
pub const MIN_DELTIFICATION_FORMAT: u8 = 6;

/// Format number used only by unreleased development builds; never
/// accepted.
const PACKED_REVPROP_SQLITE_DEV_FORMAT: u8 = 5;

/// Default shard size for newly created repositories.
pub const DEFAULT_MAX_FILES_PER_DIR: u64 = 1000;

/// Parsed contents of the format stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub number: u8,
    /// Files per shard; 0 means the linear (unsharded) layout.
    pub max_files_per_dir: u64,
}

impl Format {
    pub fn supports_mergeinfo(&self) -> bool {
        self.number >= MIN_MERGEINFO_FORMAT
    }

    pub fn sharded(&self) -> bool {
        self.max_files_per_dir > 0
    }
}

/// Reject format numbers this engine does not understand.  The check
/// happens before any file is touched.
pub fn check_format(number: u8) -> Result<()> {
    if number == PACKED_REVPROP_SQLITE_DEV_FORMAT {
        return Err(FsError::UnsupportedFormat(format!(
            "found format '{}', only created by unreleased dev builds",
            number
        )));
    }
    if (1..=FORMAT_NUMBER).contains(&number) {
        return Ok(());
    }
    Err(FsError::UnsupportedFormat(format!(
        "expected format between '1' and '{}'; found format '{}'",
        FORMAT_NUMBER, number
    )))
}

/// Read the format stamp.  An absent file means format 1 with the linear
/// layout, for compatibility with the oldest repositories.
pub fn read_format(path: &Path) -> Result<Format> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Format {
                number: 1,
                max_files_per_dir: 0,
            });
        }
        Err(e) => return Err(FsError::io(path, e)),
    };

    let mut lines = text.lines();
    let first = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| FsError::corrupt(format!("Can't read first line of format file '{}'", path.display())))?;
    let number = first.parse::<u8>().map_err(|_| {
        FsError::corrupt(format!("First line of '{}' is not a format number", path.display()))
    })?;
    check_format(number)?;

    let mut max_files_per_dir = 0;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if number >= MIN_LAYOUT_FORMAT_OPTION_FORMAT {
            if line == "layout linear" {
                max_files_per_dir = 0;
                continue;
            }
            if let Some(arg) = line.strip_prefix("layout sharded ") {
                max_files_per_dir = arg.parse::<u64>().map_err(|_| {
                    FsError::corrupt(format!(
                        "'{}' contains invalid filesystem format option '{}'",
                        path.display(),
                        line
                    ))
                })?;
                continue;
            }
        }
        return Err(FsError::corrupt(format!(
            "'{}' contains invalid filesystem format option '{}'",
            path.display(),
            line
        )));
    }

    Ok(Format {
        number,
        max_files_per_dir,
    })
}

/// Write the format stamp.  `overwrite` distinguishes initial creation
/// (plain create) from upgrade and hot-copy finalization (atomic
/// replace).
pub fn write_format(path: &Path, format: Format, overwrite: bool) -> Result<()> {
    let mut contents = format!("{}\n", format.number);
    if format.number >= MIN_LAYOUT_FORMAT_OPTION_FORMAT {
        if format.max_files_per_dir > 0 {
            contents.push_str(&format!("layout sharded {}\n", format.max_files_per_dir));
        } else {
            contents.push_str("layout linear\n");
        }
    }
    if overwrite {
        util::write_atomic(path, contents.as_bytes(), None)
    } else {
        util::create_file(path, contents.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("format");
        let fmt = Format {
            number: 6,
            max_files_per_dir: 1000,
        };
        write_format(&path, fmt, false).unwrap();
        assert_eq!(read_format(&path).unwrap(), fmt);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "6\nlayout sharded 1000\n");
    }

    #[test]
    fn test_linear_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("format");
        let fmt = Format {
            number: 4,
            max_files_per_dir: 0,
        };
        write_format(&path, fmt, false).unwrap();
        assert_eq!(read_format(&path).unwrap(), fmt);
    }

    #[test]
    fn test_absent_format_file_is_format_1() {
        let tmp = TempDir::new().unwrap();
        let fmt = read_format(&tmp.path().join("format")).unwrap();
        assert_eq!(fmt.number, 1);
        assert_eq!(fmt.max_files_per_dir, 0);
    }

    #[test]
    fn test_unknown_format_rejected_without_touching_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("format");
        std::fs::write(&path, "99\n").unwrap();
        assert!(matches!(
            read_format(&path),
            Err(FsError::UnsupportedFormat(_))
        ));
        // The dev-build blacklist entry is rejected too.
        std::fs::write(&path, "5\n").unwrap();
        assert!(matches!(
            read_format(&path),
            Err(FsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_invalid_option_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("format");
        std::fs::write(&path, "6\nlayout zigzag\n").unwrap();
        assert!(matches!(read_format(&path), Err(FsError::Corrupt(_))));
    }
}
