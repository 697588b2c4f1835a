//! `fsfs.conf` handling
//!
//! The config file is INI-style with `[section]` headers, `key = value`
//! lines, and `#`/`;`/`###` comments.  Unknown sections and keys are
//! ignored so future options do not break older readers.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::util;

pub const CONFIG_FILENAME: &str = "fsfs.conf";

pub const SECTION_CACHES: &str = "caches";
pub const SECTION_REP_SHARING: &str = "rep-sharing";
pub const SECTION_DELTIFICATION: &str = "deltification";
pub const SECTION_PACKED_REVPROPS: &str = "packed-revprops";

pub const OPT_FAIL_STOP: &str = "fail-stop";
pub const OPT_ENABLE_REP_SHARING: &str = "enable-rep-sharing";
pub const OPT_ENABLE_DIR_DELTIFICATION: &str = "enable-dir-deltification";
pub const OPT_ENABLE_PROPS_DELTIFICATION: &str = "enable-props-deltification";
pub const OPT_MAX_DELTIFICATION_WALK: &str = "max-deltification-walk";
pub const OPT_MAX_LINEAR_DELTIFICATION: &str = "max-linear-deltification";
pub const OPT_REVPROP_PACK_SIZE: &str = "revprop-pack-size";
pub const OPT_COMPRESS_PACKED_REVPROPS: &str = "compress-packed-revprops";

pub const DEFAULT_MAX_DELTIFICATION_WALK: u64 = 1023;
pub const DEFAULT_MAX_LINEAR_DELTIFICATION: u64 = 16;

/// Tuning knobs read from `fsfs.conf`, with the format-dependent
/// defaults already applied.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub fail_stop: bool,
    pub rep_sharing_allowed: bool,
    pub deltify_directories: bool,
    pub deltify_properties: bool,
    pub max_deltification_walk: u64,
    pub max_linear_deltification: u64,
    /// Uncompressed size cap of one packed-revprop group, in bytes.
    pub revprop_pack_size: u64,
    pub compress_packed_revprops: bool,
    /// Opaque `name = host:port` pairs from `[memcached-servers]`.
    pub memcached_servers: Vec<(String, String)>,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            fail_stop: false,
            rep_sharing_allowed: true,
            deltify_directories: false,
            deltify_properties: false,
            max_deltification_walk: DEFAULT_MAX_DELTIFICATION_WALK,
            max_linear_deltification: DEFAULT_MAX_LINEAR_DELTIFICATION,
            revprop_pack_size: 0x40 * 1024,
            compress_packed_revprops: false,
            memcached_servers: Vec::new(),
        }
    }
}

/// Raw parsed sections: section -> key -> value.
fn parse_ini(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_ascii_lowercase();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_ascii_lowercase();
            let value = line[eq + 1..].trim().to_string();
            sections
                .entry(current.clone())
                .or_default()
                .insert(key, value);
        }
    }
    sections
}

fn get_bool(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
    default: bool,
) -> bool {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "on" | "1"))
        .unwrap_or(default)
}

fn get_u64(
    sections: &HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
    default: u64,
) -> u64 {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

impl FsConfig {
    /// Read the config for a filesystem of the given format.  A missing
    /// file yields the defaults.  Features gated on newer formats stay
    /// disabled on older ones regardless of the file's contents.
    pub fn read(fs_path: &Path, format: u8) -> Result<FsConfig> {
        let path = fs_path.join(CONFIG_FILENAME);
        let sections = if path.exists() {
            parse_ini(&util::read_text_file(&path)?)
        } else {
            HashMap::new()
        };

        let mut config = FsConfig {
            fail_stop: get_bool(&sections, SECTION_CACHES, OPT_FAIL_STOP, false),
            ..FsConfig::default()
        };

        config.rep_sharing_allowed = if format >= crate::format::MIN_REP_SHARING_FORMAT {
            get_bool(&sections, SECTION_REP_SHARING, OPT_ENABLE_REP_SHARING, true)
        } else {
            false
        };

        if format >= crate::format::MIN_DELTIFICATION_FORMAT {
            config.deltify_directories = get_bool(
                &sections,
                SECTION_DELTIFICATION,
                OPT_ENABLE_DIR_DELTIFICATION,
                false,
            );
            config.deltify_properties = get_bool(
                &sections,
                SECTION_DELTIFICATION,
                OPT_ENABLE_PROPS_DELTIFICATION,
                false,
            );
            config.max_deltification_walk = get_u64(
                &sections,
                SECTION_DELTIFICATION,
                OPT_MAX_DELTIFICATION_WALK,
                DEFAULT_MAX_DELTIFICATION_WALK,
            );
            config.max_linear_deltification = get_u64(
                &sections,
                SECTION_DELTIFICATION,
                OPT_MAX_LINEAR_DELTIFICATION,
                DEFAULT_MAX_LINEAR_DELTIFICATION,
            );
        }

        if format >= crate::format::MIN_PACKED_REVPROP_FORMAT {
            config.compress_packed_revprops = get_bool(
                &sections,
                SECTION_PACKED_REVPROPS,
                OPT_COMPRESS_PACKED_REVPROPS,
                false,
            );
            let default_kb = if config.compress_packed_revprops {
                0x100
            } else {
                0x40
            };
            config.revprop_pack_size = get_u64(
                &sections,
                SECTION_PACKED_REVPROPS,
                OPT_REVPROP_PACK_SIZE,
                default_kb,
            ) * 1024;
        }

        if let Some(servers) = sections.get("memcached-servers") {
            let mut pairs: Vec<_> = servers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            pairs.sort();
            config.memcached_servers = pairs;
        }

        Ok(config)
    }

    /// Write the default, fully commented config template.
    pub fn write_default(fs_path: &Path) -> Result<()> {
        let contents = format!(
            "\
### This file controls the configuration of the FSFS filesystem.

[memcached-servers]
### These options name memcached servers used to cache internal FSFS
### data.  The option name is ignored; the value is of the form HOST:PORT.
# first-server = 127.0.0.1:11211

[{caches}]
### To make the filesystem fail instead of continuing when a
### cache-related error occurs, uncomment this line.
# {fail_stop} = true

[{rep_sharing}]
### To conserve space, the filesystem can optionally avoid storing
### duplicate representations.  rep-sharing is enabled by default.
# {enable_rep_sharing} = true

[{deltification}]
### Directory deltification is disabled by default.
# {enable_dir} = false
### Property deltification is disabled by default.
# {enable_props} = false
### Maximum number of predecessors walked while hunting a delta base.
### A value of 0 effectively disables deltification.
# {max_walk} = {walk_default}
### Length of the linear delta chain kept close to HEAD before
### skip-deltas take over.  A value of 1 or smaller forces pure
### skip-deltas.
# {max_linear} = {linear_default}

[{packed_revprops}]
### Size (in kBytes) of packed revprop files, applied before optional
### compression.
# {pack_size} = 64
### Compressing packed revprops is disabled by default.
# {compress} = false
",
            caches = SECTION_CACHES,
            fail_stop = OPT_FAIL_STOP,
            rep_sharing = SECTION_REP_SHARING,
            enable_rep_sharing = OPT_ENABLE_REP_SHARING,
            deltification = SECTION_DELTIFICATION,
            enable_dir = OPT_ENABLE_DIR_DELTIFICATION,
            enable_props = OPT_ENABLE_PROPS_DELTIFICATION,
            max_walk = OPT_MAX_DELTIFICATION_WALK,
            walk_default = DEFAULT_MAX_DELTIFICATION_WALK,
            max_linear = OPT_MAX_LINEAR_DELTIFICATION,
            linear_default = DEFAULT_MAX_LINEAR_DELTIFICATION,
            packed_revprops = SECTION_PACKED_REVPROPS,
            pack_size = OPT_REVPROP_PACK_SIZE,
            compress = OPT_COMPRESS_PACKED_REVPROPS,
        );
        util::create_file(&fs_path.join(CONFIG_FILENAME), contents.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = FsConfig::read(tmp.path(), 6).unwrap();
        assert!(cfg.rep_sharing_allowed);
        assert!(!cfg.deltify_directories);
        assert_eq!(cfg.max_linear_deltification, 16);
        assert_eq!(cfg.max_deltification_walk, 1023);
        assert_eq!(cfg.revprop_pack_size, 64 * 1024);
    }

    #[test]
    fn test_format_gates_override_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            "[rep-sharing]\nenable-rep-sharing = true\n",
        )
        .unwrap();
        // Rep sharing needs format >= 4 no matter what the file says.
        let cfg = FsConfig::read(tmp.path(), 3).unwrap();
        assert!(!cfg.rep_sharing_allowed);
    }

    #[test]
    fn test_parses_options_and_comments() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            "### header\n\
             [deltification]\n\
             enable-dir-deltification = true\n\
             max-linear-deltification = 4\n\
             # max-deltification-walk = 9\n\
             [packed-revprops]\n\
             revprop-pack-size = 16\n\
             compress-packed-revprops = true\n\
             [caches]\n\
             fail-stop = true\n",
        )
        .unwrap();
        let cfg = FsConfig::read(tmp.path(), 6).unwrap();
        assert!(cfg.deltify_directories);
        assert!(!cfg.deltify_properties);
        assert_eq!(cfg.max_linear_deltification, 4);
        assert_eq!(cfg.max_deltification_walk, 1023);
        assert_eq!(cfg.revprop_pack_size, 16 * 1024);
        assert!(cfg.compress_packed_revprops);
        assert!(cfg.fail_stop);
    }

    #[test]
    fn test_default_template_parses_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        FsConfig::write_default(tmp.path()).unwrap();
        let cfg = FsConfig::read(tmp.path(), 6).unwrap();
        assert!(cfg.rep_sharing_allowed);
        assert!(!cfg.compress_packed_revprops);
        assert_eq!(cfg.max_deltification_walk, 1023);
    }
}
