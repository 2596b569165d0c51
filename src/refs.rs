use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::Identity;
use crate::error::MirrorError;
use crate::naming;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTable {
    #[serde(default)]
    refs: BTreeMap<String, Identity>,
}

impl RefTable {
    pub fn load(path: &Utf8Path) -> Result<Self, MirrorError> {
        if !path.as_std_path().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| MirrorError::Filesystem(format!("parse {path}: {err}")))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), MirrorError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Store::write_bytes_atomic(path, &json)
    }

    pub fn bind(&mut self, alias: impl Into<String>, identity: Identity) -> Option<Identity> {
        self.refs.insert(alias.into(), identity)
    }

    pub fn unbind(&mut self, alias: &str) -> Option<Identity> {
        self.refs.remove(alias)
    }

    pub fn get(&self, alias: &str) -> Option<&Identity> {
        self.refs.get(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &Identity)> {
        self.refs.iter().map(|(alias, identity)| (alias.as_str(), identity))
    }

    pub fn resolve(&self, alias: &str, store: &Store) -> Result<Utf8PathBuf, MirrorError> {
        let identity = self
            .refs
            .get(alias)
            .ok_or_else(|| MirrorError::NotFound(format!("reference {alias}")))?;
        naming::latest(&store.durable_dir_for(identity), identity)?
            .single(identity)?
            .ok_or_else(|| MirrorError::NotFound(identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::FileTag;

    #[test]
    fn resolve_follows_newest_version() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root);
        store.ensure_layout().unwrap();
        let member_dir = store.member_dir();
        fs::write(member_dir.join("GSM7.10.GSM7_R01C01_Red.idat").as_std_path(), b"a").unwrap();

        let mut table = RefTable::default();
        table.bind("sheet1/row4", Identity::new("GSM7", FileTag::Red));
        table.bind("sheet2/row1", Identity::new("GSM7", FileTag::Red));
        assert!(
            table
                .resolve("sheet1/row4", &store)
                .unwrap()
                .ends_with("GSM7.10.GSM7_R01C01_Red.idat")
        );

        fs::write(member_dir.join("GSM7.20.GSM7_R01C01_Red.idat").as_std_path(), b"b").unwrap();
        assert!(
            table
                .resolve("sheet2/row1", &store)
                .unwrap()
                .ends_with("GSM7.20.GSM7_R01C01_Red.idat")
        );
        assert_matches!(
            table.resolve("unknown", &store),
            Err(MirrorError::NotFound(_))
        );
    }

    #[test]
    fn unbind_removes_only_that_alias() {
        let mut table = RefTable::default();
        table.bind("b", Identity::new("GSM2", FileTag::Green));
        table.bind("a", Identity::new("GSM1", FileTag::Red));
        assert_eq!(
            table.unbind("b"),
            Some(Identity::new("GSM2", FileTag::Green))
        );
        assert_eq!(table.unbind("b"), None);
        let listed = table
            .aliases()
            .map(|(alias, identity)| (alias.to_string(), identity.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            listed,
            vec![("a".to_string(), Identity::new("GSM1", FileTag::Red))]
        );
    }

    #[test]
    fn table_survives_reload() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("refs.json")).unwrap();
        assert_eq!(RefTable::load(&path).unwrap(), RefTable::default());

        let mut table = RefTable::default();
        table.bind("series", Identity::new("GSE9", FileTag::Soft));
        table.save(&path).unwrap();
        let loaded = RefTable::load(&path).unwrap();
        assert_eq!(loaded.get("series"), Some(&Identity::new("GSE9", FileTag::Soft)));
    }
}
