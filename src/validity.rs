use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{EntityId, FileTag, Identity, MemberId, VersionToken};
use crate::error::MirrorError;
use crate::naming;
use crate::store::Store;

pub const VALIDITY_KEY: &str = "gsequery_filt";
const VALIDITY_SUFFIX: &str = "txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidityMap {
    entries: BTreeMap<EntityId, Vec<MemberId>>,
}

impl ValidityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (EntityId, Vec<MemberId>)>,
    {
        let mut map = Self::new();
        for (entity, members) in entries {
            map.insert(entity, members);
        }
        map
    }

    pub fn insert(&mut self, entity: EntityId, members: Vec<MemberId>) {
        let slot = self.entries.entry(entity).or_default();
        for member in members {
            if !slot.contains(&member) {
                slot.push(member);
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, MirrorError> {
        let mut map = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else {
                continue;
            };
            let entity = first
                .parse::<EntityId>()
                .map_err(|err| MirrorError::ValidityParse {
                    line: line_no,
                    message: err.to_string(),
                })?;
            let members = tokens
                .map(|token| {
                    token
                        .parse::<MemberId>()
                        .map_err(|err| MirrorError::ValidityParse {
                            line: line_no,
                            message: err.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            map.insert(entity, members);
        }
        Ok(map)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, MirrorError> {
        let text = fs::read_to_string(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("read {path}: {err}")))?;
        Self::parse(&text)
    }

    pub fn load_latest(dir: &Utf8Path) -> Result<(Utf8PathBuf, Self), MirrorError> {
        let identity = validity_identity();
        let path = naming::latest(dir, &identity)?
            .single(&identity)?
            .ok_or_else(|| MirrorError::NotFound(format!("{VALIDITY_KEY} in {dir}")))?;
        let map = Self::load(&path)?;
        Ok((path, map))
    }

    pub fn store(&self, dir: &Utf8Path, token: VersionToken) -> Result<Utf8PathBuf, MirrorError> {
        let identity = validity_identity();
        let current = naming::versions(dir, &identity)?
            .last()
            .map(|(token, _)| *token);
        let file_name = naming::name(&identity, token.successor_of(current), VALIDITY_SUFFIX);
        let path = dir.join(file_name);
        Store::write_bytes_atomic(&path, self.render().as_bytes())?;
        Ok(path)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (entity, members) in &self.entries {
            out.push_str(entity.as_str());
            for member in members {
                out.push(' ');
                out.push_str(member.as_str());
            }
            out.push('\n');
        }
        out
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.keys()
    }

    pub fn members(&self, entity: &EntityId) -> Option<&[MemberId]> {
        self.entries.get(entity).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn diff(&self, other: &ValidityMap) -> BTreeSet<EntityId> {
        let mut changed = BTreeSet::new();
        for (entity, members) in &self.entries {
            match other.entries.get(entity) {
                Some(theirs) if same_members(members, theirs) => {}
                _ => {
                    changed.insert(entity.clone());
                }
            }
        }
        for entity in other.entries.keys() {
            if !self.entries.contains_key(entity) {
                changed.insert(entity.clone());
            }
        }
        changed
    }

    pub fn filter_members(&self, allowed: &BTreeSet<MemberId>) -> ValidityMap {
        self.retain_members(|member| allowed.contains(member))
    }

    pub fn exclude(&self, excluded: &BTreeSet<MemberId>) -> ValidityMap {
        self.retain_members(|member| !excluded.contains(member))
    }

    fn retain_members<F>(&self, keep: F) -> ValidityMap
    where
        F: Fn(&MemberId) -> bool,
    {
        let entries = self
            .entries
            .iter()
            .filter_map(|(entity, members)| {
                let kept = members
                    .iter()
                    .filter(|member| keep(member))
                    .cloned()
                    .collect::<Vec<_>>();
                (!kept.is_empty()).then(|| (entity.clone(), kept))
            })
            .collect();
        ValidityMap { entries }
    }
}

fn same_members(left: &[MemberId], right: &[MemberId]) -> bool {
    let left = left.iter().collect::<BTreeSet<_>>();
    let right = right.iter().collect::<BTreeSet<_>>();
    left == right
}

fn validity_identity() -> Identity {
    Identity::new(VALIDITY_KEY, FileTag::classify(VALIDITY_SUFFIX))
}

pub fn parse_listing(text: &str) -> ValidityMap {
    let mut map = ValidityMap::new();
    for line in text.lines() {
        let tokens = line.split(['\t', ' ']).map(str::trim).collect::<Vec<_>>();
        let entities = tokens
            .iter()
            .filter_map(|token| token.parse::<EntityId>().ok())
            .collect::<Vec<_>>();
        let members = tokens
            .iter()
            .filter_map(|token| token.parse::<MemberId>().ok())
            .collect::<Vec<_>>();
        for entity in entities {
            map.insert(entity, members.clone());
        }
    }
    map
}

pub fn parse_member_listing(text: &str) -> BTreeSet<MemberId> {
    text.split_whitespace()
        .filter_map(|token| token.parse::<MemberId>().ok())
        .collect()
}

pub fn backlog(
    current: &ValidityMap,
    previous: Option<&ValidityMap>,
    seen: &BTreeSet<EntityId>,
    force: bool,
) -> Vec<EntityId> {
    if force {
        return current.entities().cloned().collect();
    }
    let changed = previous.map(|previous| current.diff(previous)).unwrap_or_default();
    current
        .entities()
        .filter(|entity| !seen.contains(*entity) || changed.contains(*entity))
        .cloned()
        .collect()
}
