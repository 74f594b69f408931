#![allow(dead_code)]

pub mod backtracker;
pub mod cachedb;
pub mod error;
pub mod fdupes;
pub mod fileid;
pub mod filetree;
pub mod glob_matcher;
pub mod groupprint;
pub mod hasher;
pub mod logging;
pub mod matcher;
pub mod onegraph;
pub mod proptree;

pub use cachedb::{CacheStore, DEFAULT_DB_PREFIX};
pub use hasher::{Fingerprint, Hasher, XxHash64Hasher};
pub use matcher::{SyncCmd, TreePairMatcher};
pub use proptree::{PropertyTree, TreeConfig};

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod matcher_tests;
#[cfg(test)]
mod proptree_tests;
