use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::topology::server::ServerDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> ReadPreference {
        ReadPreference {
            mode,
            tag_sets: tag_sets.unwrap_or_default(),
        }
    }

    /// Parses a tag set of the form `key:value,key:value`. The empty string is the empty set,
    /// which matches every server.
    pub fn parse_tag_set(tags: &str) -> Result<TagSet> {
        let mut tag_set = TagSet::new();
        for pair in tags.split(',').filter(|pair| !pair.is_empty()) {
            match pair.find(':') {
                Some(idx) => {
                    tag_set.insert(pair[..idx].to_string(), pair[idx + 1..].to_string());
                }
                None => {
                    return Err(Error::configuration(format!(
                        "invalid read preference tag \"{}\"",
                        pair
                    )))
                }
            }
        }
        Ok(tag_set)
    }
}

/// Chooses which servers an operation may run on.
#[derive(Clone)]
pub enum ServerSelector {
    /// Servers that accept writes.
    Writable,
    /// Servers eligible under a read preference.
    Read(ReadPreference),
    /// Available data-bearing servers the predicate accepts.
    Predicate(Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>),
}

impl ServerSelector {
    pub fn primary() -> ServerSelector {
        ServerSelector::Read(ReadPreference::new(ReadMode::Primary, None))
    }

    pub fn predicate<F>(predicate: F) -> ServerSelector
    where
        F: Fn(&ServerDescription) -> bool + Send + Sync + 'static,
    {
        ServerSelector::Predicate(Arc::new(predicate))
    }
}

impl fmt::Debug for ServerSelector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ServerSelector::Writable => fmt.write_str("Writable"),
            ServerSelector::Read(ref read_pref) => write!(fmt, "Read({:?})", read_pref),
            ServerSelector::Predicate(_) => fmt.write_str("Predicate"),
        }
    }
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ServerSelector::Writable => fmt.write_str("a writable server"),
            ServerSelector::Read(ref read_pref) if read_pref.tag_sets.is_empty() => {
                write!(fmt, "a server matching read preference {:?}", read_pref.mode)
            }
            ServerSelector::Read(ref read_pref) => write!(
                fmt,
                "a server matching read preference {:?} with tag sets {:?}",
                read_pref.mode, read_pref.tag_sets
            ),
            ServerSelector::Predicate(_) => fmt.write_str("a server matching a custom predicate"),
        }
    }
}
