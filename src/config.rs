//! The capture configuration: an INI-like description of which paths are
//! excluded from capture, which streams should not be compressed, and which
//! need alignment.
//!
//! The grammar accepts CRLF or LF line endings, normalises backslashes to
//! forward slashes, and strips a leading drive-letter prefix from each
//! line. A final line without a newline is accepted.

use log::debug;

use crate::error::{Error, Result};
use crate::pattern::PatternList;
use crate::util::path_basename;

/// Capture configuration used when the caller supplies none.
pub const DEFAULT_CONFIG: &str = "\
[ExclusionList]\n\
\\$ntfs.log\n\
\\hiberfil.sys\n\
\\pagefile.sys\n\
\\System Volume Information\n\
\\RECYCLER\n\
\\Windows\\CSC\n\
\n\
[CompressionExclusionList]\n\
*.mp3\n\
*.zip\n\
*.cab\n\
\\WINDOWS\\inf\\*.pnf\n";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    ExclusionList,
    ExclusionException,
    CompressionExclusionList,
    AlignmentList,
}

/// A parsed capture configuration.
#[derive(Debug, Default)]
pub struct CaptureConfig {
    /// Paths matching these patterns are excluded from capture.
    pub exclusion_list: PatternList,
    /// Exceptions to the exclusion list.
    pub exclusion_exception: PatternList,
    /// Streams matching these patterns are stored uncompressed.
    pub compression_exclusion_list: PatternList,
    /// Streams matching these patterns are aligned in the archive.
    pub alignment_list: PatternList,
    prefix: String,
    source_text: String,
}

impl CaptureConfig {
    /// Parses configuration text into pattern lists.
    ///
    /// An unknown `[Section]` header, or a pattern appearing before any
    /// header, is fatal.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = CaptureConfig {
            source_text: text.to_owned(),
            ..CaptureConfig::default()
        };
        let mut section = Section::None;

        for (idx, raw) in text.split('\n').enumerate() {
            let line_no = idx + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }

            let mut line = line.replace('\\', "/");
            let bytes = line.as_bytes();
            if bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
                line.drain(..2);
            }

            match line.as_str() {
                "[ExclusionList]" => section = Section::ExclusionList,
                "[ExclusionException]" => section = Section::ExclusionException,
                "[CompressionExclusionList]" => section = Section::CompressionExclusionList,
                "[AlignmentList]" => section = Section::AlignmentList,
                _ if line.starts_with('[') && line.contains(']') => {
                    return Err(Error::InvalidCaptureConfig(format!(
                        "unknown section {line:?} on line {line_no}"
                    )));
                }
                _ => {
                    let list = match section {
                        Section::None => {
                            return Err(Error::InvalidCaptureConfig(format!(
                                "line {line_no} is not inside a section (such as [ExclusionList])"
                            )));
                        }
                        Section::ExclusionList => &mut config.exclusion_list,
                        Section::ExclusionException => &mut config.exclusion_exception,
                        Section::CompressionExclusionList => {
                            &mut config.compression_exclusion_list
                        }
                        Section::AlignmentList => &mut config.alignment_list,
                    };
                    debug!("adding pattern {line:?}");
                    list.add(&line)?;
                }
            }
        }

        Ok(config)
    }

    /// Sets the filesystem path of the tree currently being captured.
    ///
    /// The prefix is stripped from paths before matching, so that a pattern
    /// like `/hiberfil.sys` works regardless of where the source tree is
    /// mounted.
    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_owned();
    }

    /// Whether the configuration excludes `path` from capture.
    ///
    /// With `strip_prefix`, the capture prefix (and the following `/`) is
    /// removed from `path` before matching.
    pub fn exclude_path(&self, path: &str, strip_prefix: bool) -> bool {
        let mut p = path;
        if strip_prefix && !self.prefix.is_empty() {
            if let Some(rest) = path.strip_prefix(self.prefix.as_str()) {
                if rest.starts_with('/') {
                    p = rest;
                }
            }
        }
        let basename = path_basename(p);
        self.exclusion_list.matches(p, basename)
            && !self.exclusion_exception.matches(p, basename)
    }

    /// Whether the stream at `path` (an image path) should be stored
    /// uncompressed.
    pub fn compression_excluded(&self, path: &str) -> bool {
        self.compression_exclusion_list
            .matches(path, path_basename(path))
    }

    /// The raw configuration text this was parsed from.
    pub fn source_text(&self) -> &str {
        &self.source_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.exclusion_list.len(), 6);
        assert_eq!(config.exclusion_exception.len(), 0);
        assert_eq!(config.compression_exclusion_list.len(), 4);
        assert_eq!(config.alignment_list.len(), 0);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let a = CaptureConfig::parse(DEFAULT_CONFIG).unwrap();
        let b = CaptureConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(
            a.exclusion_list.texts().collect::<Vec<_>>(),
            b.exclusion_list.texts().collect::<Vec<_>>()
        );
        assert_eq!(
            a.compression_exclusion_list.texts().collect::<Vec<_>>(),
            b.compression_exclusion_list.texts().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_backslashes_and_drive_letters() {
        let config = CaptureConfig::parse("[ExclusionList]\nC:\\Windows\\Temp\n").unwrap();
        assert_eq!(
            config.exclusion_list.texts().collect::<Vec<_>>(),
            ["/Windows/Temp"]
        );
    }

    #[test]
    fn test_crlf_line_endings() {
        let config =
            CaptureConfig::parse("[ExclusionList]\r\n\\pagefile.sys\r\n").unwrap();
        assert!(config.exclude_path("/pagefile.sys", false));
    }

    #[test]
    fn test_missing_final_newline() {
        let config = CaptureConfig::parse("[ExclusionList]\n\\pagefile.sys").unwrap();
        assert!(config.exclude_path("/pagefile.sys", false));
    }

    #[test]
    fn test_unknown_section_is_fatal() {
        assert!(matches!(
            CaptureConfig::parse("[NoSuchSection]\n"),
            Err(Error::InvalidCaptureConfig(_))
        ));
    }

    #[test]
    fn test_pattern_before_section_is_fatal() {
        assert!(matches!(
            CaptureConfig::parse("*.mp3\n[ExclusionList]\n"),
            Err(Error::InvalidCaptureConfig(_))
        ));
    }

    #[test]
    fn test_exclusion_exception() {
        let config = CaptureConfig::parse(
            "[ExclusionList]\n*.tmp\n[ExclusionException]\n\\keep.tmp\n",
        )
        .unwrap();
        assert!(config.exclude_path("/scratch.tmp", false));
        assert!(!config.exclude_path("/keep.tmp", false));
    }

    #[test]
    fn test_prefix_stripping() {
        let mut config = CaptureConfig::parse(DEFAULT_CONFIG).unwrap();
        config.set_prefix("/mnt/windows7");
        assert!(config.exclude_path("/mnt/windows7/hiberfil.sys", true));
        // Without stripping, the anchored pattern does not match.
        assert!(!config.exclude_path("/mnt/windows7/hiberfil.sys", false));
        // The prefix must be followed by a separator to be stripped.
        assert!(!config.exclude_path("/mnt/windows7extra/hiberfil.sys", true));
    }

    #[test]
    fn test_compression_exclusion() {
        let config = CaptureConfig::parse(DEFAULT_CONFIG).unwrap();
        assert!(config.compression_excluded("/music/track.mp3"));
        assert!(config.compression_excluded("/WINDOWS/inf/oem0.pnf"));
        assert!(!config.compression_excluded("/music/track.flac"));
    }
}
