use assert_matches::assert_matches;

use geo_mirror::domain::{EntityId, FileTag, Identity, MemberId, VersionToken};
use geo_mirror::error::MirrorError;
use geo_mirror::naming::{self, DurableName};

#[test]
fn parse_entity_id_valid() {
    let id: EntityId = "gse102902".parse().unwrap();
    assert_eq!(id.as_str(), "GSE102902");
}

#[test]
fn parse_entity_id_invalid() {
    let err = "GSM102902".parse::<EntityId>().unwrap_err();
    assert_matches!(err, MirrorError::InvalidEntityId(_));
}

#[test]
fn parse_member_id_invalid() {
    let err = "GSM12a".parse::<MemberId>().unwrap_err();
    assert_matches!(err, MirrorError::InvalidMemberId(_));
}

#[test]
fn sample_files_map_to_channel_identities() {
    let member: MemberId = "GSM1505330".parse().unwrap();
    assert_eq!(
        Identity::sample_file(&member, "GSM1505330_9376538060_R04C01_Grn.idat.gz"),
        Identity::new("GSM1505330", FileTag::Green)
    );
    assert_eq!(
        Identity::sample_file(&member, "GSM1505330_9376538060_R04C01_Red.idat.gz").tag,
        FileTag::Red
    );
}

#[test]
fn durable_names_round_trip_through_parse() {
    let identity = Identity::new("GSM1505330", FileTag::Red);
    let file_name = naming::name(
        &identity,
        VersionToken(1_607_018_051),
        "GSM1505330_9376538060_R04C01_Red.idat.gz",
    );
    assert_eq!(
        file_name,
        "GSM1505330.1607018051.GSM1505330_9376538060_R04C01_Red.idat.gz"
    );
    let parsed = DurableName::parse(&file_name).unwrap();
    assert!(parsed.matches(&identity));
    assert!(!parsed.matches(&Identity::new("GSM1505330", FileTag::Green)));
}

#[test]
fn version_successor_never_repeats() {
    let run = VersionToken(100);
    assert_eq!(run.successor_of(None), VersionToken(100));
    assert_eq!(run.successor_of(Some(VersionToken(50))), VersionToken(100));
    assert_eq!(run.successor_of(Some(VersionToken(100))), VersionToken(101));
    assert_eq!(run.successor_of(Some(VersionToken(140))), VersionToken(141));
}
