//! Glob pattern lists for the capture configuration.
//!
//! Patterns use POSIX glob syntax (`*`, `?`, `[...]`) with `/` as the path
//! separator. Matching is path-aware (wildcards do not cross `/`) and
//! case-insensitive. Which part of a path a pattern is tested against
//! depends on the pattern's shape:
//!
//! - a pattern starting with `/` matches the full path from the capture
//!   root;
//! - a pattern containing `/` anywhere else matches the path without its
//!   leading slash;
//! - any other pattern matches the basename alone.

use globset::{GlobBuilder, GlobMatcher};
use log::debug;

use crate::error::{Error, Result};

/// One compiled pattern, retaining its source text for shape dispatch.
#[derive(Debug)]
struct Pattern {
    text: String,
    matcher: GlobMatcher,
}

/// An ordered list of glob patterns.
#[derive(Debug, Default)]
pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl PatternList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `pattern` and appends it to the list.
    pub fn add(&mut self, pattern: &str) -> Result<()> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidCaptureConfig(format!("bad pattern {pattern:?}: {e}")))?;
        self.patterns.push(Pattern {
            text: pattern.to_owned(),
            matcher: glob.compile_matcher(),
        });
        Ok(())
    }

    /// Number of patterns in the list.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The pattern texts, in insertion order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.text.as_str())
    }

    /// Tests `path` (absolute from the capture root, with basename
    /// `basename`) against every pattern in the list.
    pub fn matches(&self, path: &str, basename: &str) -> bool {
        for pat in &self.patterns {
            let candidate = if pat.text.starts_with('/') {
                path
            } else if pat.text.contains('/') {
                path.strip_prefix('/').unwrap_or(path)
            } else {
                basename
            };
            if pat.matcher.is_match(candidate) {
                debug!("{candidate:?} matches the pattern {:?}", pat.text);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> PatternList {
        let mut l = PatternList::new();
        for p in patterns {
            l.add(p).unwrap();
        }
        l
    }

    #[test]
    fn test_basename_pattern() {
        let l = list(&["*.mp3"]);
        assert!(l.matches("/music/song.mp3", "song.mp3"));
        assert!(!l.matches("/music/song.ogg", "song.ogg"));
    }

    #[test]
    fn test_case_folded() {
        let l = list(&["/hiberfil.sys"]);
        assert!(l.matches("/HIBERFIL.SYS", "HIBERFIL.SYS"));
        assert!(l.matches("/hiberfil.sys", "hiberfil.sys"));
    }

    #[test]
    fn test_anchored_pattern_does_not_match_subdirectory() {
        let l = list(&["/pagefile.sys"]);
        assert!(l.matches("/pagefile.sys", "pagefile.sys"));
        assert!(!l.matches("/sub/pagefile.sys", "pagefile.sys"));
    }

    #[test]
    fn test_wildcard_does_not_cross_separator() {
        let l = list(&["/WINDOWS/inf/*.pnf"]);
        assert!(l.matches("/WINDOWS/inf/foo.pnf", "foo.pnf"));
        assert!(!l.matches("/WINDOWS/inf/deeper/foo.pnf", "foo.pnf"));
    }

    #[test]
    fn test_relative_pattern_matches_without_leading_slash() {
        let l = list(&["Windows/CSC"]);
        assert!(l.matches("/Windows/CSC", "CSC"));
    }

    #[test]
    fn test_character_class() {
        let l = list(&["file[0-9].dat"]);
        assert!(l.matches("/x/file7.dat", "file7.dat"));
        assert!(!l.matches("/x/fileA.dat", "fileA.dat"));
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let mut l = PatternList::new();
        assert!(matches!(
            l.add("[unterminated"),
            Err(Error::InvalidCaptureConfig(_))
        ));
    }
}
