use std::collections::BTreeSet;

use camino::Utf8PathBuf;

use geo_mirror::domain::{EntityId, VersionToken};
use geo_mirror::validity::{self, ValidityMap};

const SERIES_LISTING: &str = "\
200066316\tGSE66316\tGSM1618370 GSM1618371 GSM1618372
200061044\tGSE61044\tGSM1498399 GSM1498400
200047915\tGSE47915\tGSM1160218
";

const SAMPLE_LISTING: &str = "\
301618370\tGSM1618370
301618371\tGSM1618371
301498399\tGSM1498399
301498400\tGSM1498400
";

#[test]
fn query_listings_become_a_stored_validity_map() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().join("equery")).unwrap();

    let series = validity::parse_listing(SERIES_LISTING);
    let samples = validity::parse_member_listing(SAMPLE_LISTING);
    let excluded = validity::parse_member_listing("GSM1498400\n");
    let filtered = series.filter_members(&samples).exclude(&excluded);

    let entities = filtered.entities().map(EntityId::as_str).collect::<Vec<_>>();
    assert_eq!(entities, vec!["GSE61044", "GSE66316"]);
    let gse61044: EntityId = "GSE61044".parse().unwrap();
    assert_eq!(filtered.members(&gse61044).unwrap().len(), 1);

    let first = filtered.store(&dir, VersionToken(500)).unwrap();
    assert!(first.ends_with("gsequery_filt.500.txt"));
    let second = series.store(&dir, VersionToken(500)).unwrap();
    assert!(second.ends_with("gsequery_filt.501.txt"));

    let (path, loaded) = ValidityMap::load_latest(&dir).unwrap();
    assert_eq!(path, second);
    assert_eq!(loaded, series);
}

#[test]
fn backlog_is_unseen_plus_changed() {
    let current = ValidityMap::parse("GSE1 GSM1 GSM2\nGSE2 GSM3\nGSE3 GSM4\n").unwrap();
    let previous = ValidityMap::parse("GSE1 GSM2 GSM1\nGSE3 GSM4 GSM5\n").unwrap();
    let seen = ["GSE1", "GSE2", "GSE3"]
        .iter()
        .map(|id| id.parse::<EntityId>().unwrap())
        .collect::<BTreeSet<_>>();

    let backlog = validity::backlog(&current, Some(&previous), &seen, false);
    assert_eq!(backlog, vec!["GSE2".parse().unwrap(), "GSE3".parse().unwrap()]);
    assert!(validity::backlog(&current, None, &seen, false).is_empty());
    assert_eq!(validity::backlog(&current, None, &seen, true).len(), 3);
}
