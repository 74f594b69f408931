//! Formatted output for grouped file lists.
//!
//! Each group is a set of related files located across several trees (all
//! copies of one fingerprint, say). Groups print either one path per line
//! with a blank line between groups, or as a single space-separated line
//! with spaces and backslashes escaped. Optionally groups are held back and
//! flushed sorted by average file size.

use std::io::Write;

use anyhow::Result;

use crate::fdupes::LocatedFiles;
use crate::proptree::PropertyTree;

pub struct GroupedFilePrinter {
    /// When false, print every link of a file as if it were its own file.
    hard_links: bool,
    /// Print all links even when `hard_links` collapses them to one entry.
    all_links: bool,
    same_line: bool,
    sort: bool,
    /// Buffered groups (only when sorting): (average size, rendered paths).
    held: Vec<(u64, Vec<String>)>,
    printed_any: bool,
}

impl GroupedFilePrinter {
    pub fn new(hard_links: bool, all_links: bool, same_line: bool, sort: bool) -> Self {
        GroupedFilePrinter {
            hard_links,
            all_links,
            same_line,
            sort,
            held: Vec::new(),
            printed_any: false,
        }
    }

    pub fn add_group(
        &mut self,
        out: &mut dyn Write,
        trees: &[PropertyTree],
        located: &LocatedFiles,
    ) -> Result<()> {
        let mut paths: Vec<String> = Vec::new();
        let mut total_size: u64 = 0;
        let mut count: u64 = 0;
        for (tree_index, ids) in located {
            let tree = &trees[*tree_index];
            for id in ids {
                let Some(file) = tree.tree().file(*id) else {
                    continue;
                };
                total_size += file.stamp.size;
                count += 1;
                if self.hard_links && !self.all_links {
                    paths.push(tree.printable_path(&file.paths[0]));
                } else {
                    for path in &file.paths {
                        paths.push(tree.printable_path(path));
                    }
                }
            }
        }
        if paths.is_empty() {
            return Ok(());
        }
        if self.sort {
            let avg = total_size / count.max(1);
            self.held.push((avg, paths));
        } else {
            self.print_group(out, &paths)?;
        }
        Ok(())
    }

    /// Print buffered groups. A no-op unless sorting.
    pub fn flush(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut held = std::mem::take(&mut self.held);
        held.sort_by_key(|&(avg, _)| avg);
        for (_, paths) in held {
            self.print_group(out, &paths)?;
        }
        Ok(())
    }

    fn print_group(&mut self, out: &mut dyn Write, paths: &[String]) -> Result<()> {
        if self.same_line {
            let escaped: Vec<String> = paths.iter().map(|p| escape_path(p)).collect();
            writeln!(out, "{}", escaped.join(" "))?;
        } else {
            if self.printed_any {
                writeln!(out)?;
            }
            for path in paths {
                writeln!(out, "{path}")?;
            }
        }
        self.printed_any = true;
        Ok(())
    }
}

fn escape_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape_path("a b"), "a\\ b");
        assert_eq!(escape_path("a\\b c"), "a\\\\b\\ c");
    }
}
