//! Exclude-pattern matching for tree scans.
//!
//! Patterns are glob strings over tree-relative paths, rsync-flavored:
//! a leading `/` anchors the pattern at the directory the matcher is rooted
//! at, a trailing `/` makes it match directories only, and a `**` component
//! spans any number of directories. Matching happens one directory at a
//! time: a matcher classifies basenames in its directory and derives the
//! matcher for a subdirectory with [`GlobMatcher::descend`], so deep scans
//! never re-match full paths.

use anyhow::Result;
use glob::Pattern;

use crate::anyhow_loc;
use crate::function_name;

#[derive(Clone, Debug)]
struct ExcludePattern {
    /// Path components; `None` is a `**` component.
    components: Vec<Option<Pattern>>,
    /// Anchored patterns apply only at the matcher's own directory.
    anchored: bool,
    /// Matches directories only (trailing `/`).
    dir_only: bool,
}

impl ExcludePattern {
    fn parse(text: &str) -> Result<Self> {
        let mut s = text;
        let anchored = s.starts_with('/');
        if anchored {
            s = &s[1..];
        }
        let dir_only = s.ends_with('/');
        if dir_only {
            s = &s[..s.len() - 1];
        }
        if s.is_empty() {
            return Err(anyhow_loc!("empty exclude pattern [{}]", text));
        }
        let components = s
            .split('/')
            .map(|c| {
                if c == "**" {
                    Ok(None)
                } else {
                    Pattern::new(c)
                        .map(Some)
                        .map_err(|e| anyhow_loc!("bad exclude pattern [{}]: {}", text, e))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExcludePattern {
            components,
            anchored,
            dir_only,
        })
    }

    /// Can this pattern match exactly the single component `name` here?
    fn matches_name(&self, name: &str) -> bool {
        fn go(components: &[Option<Pattern>], name: &str) -> bool {
            match components {
                [] => false,
                [Some(p)] => p.matches(name),
                [None] => true, // lone ** swallows the name
                [None, rest @ ..] => go(rest, name),
                _ => false, // several components left: needs a deeper path
            }
        }
        go(&self.components, name)
    }

    /// Patterns applicable inside subdirectory `name`.
    fn descend(&self, name: &str) -> Vec<ExcludePattern> {
        let mut out = Vec::new();
        if !self.anchored {
            // Floating patterns restart at every level.
            out.push(self.clone());
        }
        self.consume_head(&self.components, name, &mut out);
        out
    }

    fn consume_head(&self, components: &[Option<Pattern>], name: &str, out: &mut Vec<ExcludePattern>) {
        match components {
            [] | [_] => {}
            [None, rest @ ..] => {
                // ** swallows this component and stays in play.
                out.push(ExcludePattern {
                    components: components.to_vec(),
                    anchored: true,
                    dir_only: self.dir_only,
                });
                // Or it spans nothing and the next component must match now.
                self.consume_head(rest, name, out);
            }
            [Some(p), rest @ ..] => {
                if p.matches(name) {
                    out.push(ExcludePattern {
                        components: rest.to_vec(),
                        anchored: true,
                        dir_only: self.dir_only,
                    });
                }
            }
        }
    }
}

/// A set of exclude patterns scoped to one directory of the scan.
#[derive(Clone, Debug, Default)]
pub struct GlobMatcher {
    patterns: Vec<ExcludePattern>,
}

impl GlobMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| ExcludePattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(GlobMatcher { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Should the file entry `name` in this directory be excluded?
    pub fn exclude_file(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| !p.dir_only && p.matches_name(name))
    }

    /// Should the directory entry `name` in this directory be excluded?
    pub fn exclude_dir(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_name(name))
    }

    /// Matcher for the subdirectory `name`, or None when no pattern can
    /// apply below it.
    pub fn descend(&self, name: &str) -> Option<GlobMatcher> {
        let patterns: Vec<ExcludePattern> =
            self.patterns.iter().flat_map(|p| p.descend(name)).collect();
        if patterns.is_empty() {
            None
        } else {
            Some(GlobMatcher { patterns })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(pats: &[&str]) -> GlobMatcher {
        GlobMatcher::new(pats).unwrap()
    }

    #[test]
    fn plain_name_excludes_files_and_dirs() {
        let m = matcher(&["*.tmp"]);
        assert!(m.exclude_file("a.tmp"));
        assert!(m.exclude_dir("a.tmp"));
        assert!(!m.exclude_file("a.txt"));
    }

    #[test]
    fn dir_only_pattern_leaves_files_alone() {
        let m = matcher(&["build/"]);
        assert!(m.exclude_dir("build"));
        assert!(!m.exclude_file("build"));
    }

    #[test]
    fn unanchored_applies_at_depth() {
        let m = matcher(&["*.pyc"]);
        let sub = m.descend("pkg").expect("pattern should float down");
        assert!(sub.exclude_file("mod.pyc"));
    }

    #[test]
    fn anchored_applies_only_at_root() {
        let m = matcher(&["/top.txt"]);
        assert!(m.exclude_file("top.txt"));
        assert!(m.descend("sub").is_none());
    }

    #[test]
    fn multi_component_consumes_per_level() {
        let m = matcher(&["/docs/draft*"]);
        assert!(!m.exclude_file("draft1"));
        let sub = m.descend("docs").unwrap();
        assert!(sub.exclude_file("draft1"));
        assert!(m.descend("src").is_none());
    }

    #[test]
    fn star_star_matches_any_depth() {
        let m = matcher(&["/**/cache"]);
        let a = m.descend("a").unwrap();
        assert!(a.exclude_dir("cache"));
        let ab = a.descend("b").unwrap();
        assert!(ab.exclude_dir("cache"));
    }
}
