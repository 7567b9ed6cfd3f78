//! PDR parsing integration tests
//!
//! Real-world shaped delivery records: the MODAPS MOD09GQ record, a
//! multi-granule MYG29 record filtered by granule id, and malformed records.

mod helpers;

use granary_common::types::ChecksumType;
use granary_ingest::discovery::pdr_archive_key;
use granary_ingest::models::DiscoveredFile;
use granary_ingest::pdr::pan;
use granary_ingest::{InMemoryCollections, InMemoryObjectStore, ObjectStore, PdrParser};
use helpers::{init_tracing, mod09gq, myg29, MockProvider};
use std::sync::Arc;

const MOD09GQ_PDR: &str = r#"
ORIGINATING_SYSTEM = GSFC;
TOTAL_FILE_COUNT = 2;
EXPIRATION_TIME = 2017-09-13T19:52:31Z;
OBJECT = FILE_GROUP;
  DATA_TYPE = MOD09GQ;
  DATA_VERSION = 006;
  NODE_NAME = modpdr01;
  OBJECT = FILE_SPEC;
    DIRECTORY_ID = /MODOPS/MODAPS/EDC/CUMULUS/FPROC/DATA;
    FILE_ID = MOD09GQ.A2017224.h09v02.006.2017227165020.hdf;
    FILE_TYPE = HDF-EOS;
    FILE_SIZE = 17865615;
    FILE_CKSUM_TYPE = CKSUM;
    FILE_CKSUM_VALUE = 4208254019;
  END_OBJECT = FILE_SPEC;
  OBJECT = FILE_SPEC;
    DIRECTORY_ID = /MODOPS/MODAPS/EDC/CUMULUS/FPROC/DATA;
    FILE_ID = MOD09GQ.A2017224.h09v02.006.2017227165020.hdf.met;
    FILE_TYPE = METADATA;
    FILE_SIZE = 44118;
  END_OBJECT = FILE_SPEC;
END_OBJECT = FILE_GROUP;
"#;

fn myg29_group(granule: &str) -> String {
    format!(
        r#"
OBJECT = FILE_GROUP;
  DATA_TYPE = MYG29;
  DATA_VERSION = 006;
  OBJECT = FILE_SPEC;
    DIRECTORY_ID = /MYG29/2012;
    FILE_ID = {granule}.006.2015101120000.hdf;
    FILE_TYPE = HDF;
    FILE_SIZE = 1000;
  END_OBJECT = FILE_SPEC;
  OBJECT = FILE_SPEC;
    DIRECTORY_ID = /MYG29/2012;
    FILE_ID = {granule}.006.2015101120000.hdf.met;
    FILE_TYPE = METADATA;
    FILE_SIZE = 10;
  END_OBJECT = FILE_SPEC;
END_OBJECT = FILE_GROUP;
"#
    )
}

fn parser() -> PdrParser {
    PdrParser::new(Arc::new(InMemoryCollections::with([mod09gq(), myg29()])))
}

// ============================================================================
// Well-formed records
// ============================================================================

#[tokio::test]
async fn test_mod09gq_pdr() {
    init_tracing();
    let result = parser().parse(MOD09GQ_PDR).await.unwrap();

    assert_eq!(result.granules_count, 1);
    assert_eq!(result.files_count, 2);
    assert_eq!(result.total_size, 17865615 + 44118);

    let granule = &result.granules[0];
    assert_eq!(granule.granule_id, "MOD09GQ.A2017224.h09v02.006.2017227165020");
    assert_eq!(granule.data_type, "MOD09GQ");
    assert_eq!(granule.version, "006");

    let hdf = &granule.files[0];
    assert_eq!(hdf.name, "MOD09GQ.A2017224.h09v02.006.2017227165020.hdf");
    assert_eq!(hdf.remote_path, "/MODOPS/MODAPS/EDC/CUMULUS/FPROC/DATA");
    assert_eq!(hdf.size, Some(17865615));
    assert_eq!(hdf.embedded_checksum(), Some((ChecksumType::Cksum, "4208254019")));
    assert_eq!(hdf.file_type.as_deref(), Some("HDF-EOS"));
    assert_eq!(granule.files[1].embedded_checksum(), None);
}

#[tokio::test]
async fn test_granule_id_filter() {
    let text = [
        myg29_group("MYG29_S1D_SIR.A2012254.tiled"),
        myg29_group("MYG29_N1D_SIR.A2012254.tiled"),
        myg29_group("MYG29_S1D_SIR.A2012255.tiled"),
    ]
    .concat();

    let unfiltered = parser().parse(&text).await.unwrap();
    assert_eq!(unfiltered.granules_count, 3);

    let result = parser()
        .with_granule_id_filter("^MYG29_S1D_SIR.*")
        .unwrap()
        .parse(&text)
        .await
        .unwrap();

    let ids: Vec<_> = result.granules.iter().map(|g| g.granule_id.as_str()).collect();
    assert_eq!(ids, vec!["MYG29_S1D_SIR.A2012254", "MYG29_S1D_SIR.A2012255"]);
    assert_eq!(result.granules_count, 2);
    assert_eq!(result.files_count, 4);
    assert_eq!(result.total_size, 2 * 1010);
}

// ============================================================================
// Malformed records
// ============================================================================

#[tokio::test]
async fn test_missing_file_id() {
    let text = MOD09GQ_PDR.replace("    FILE_ID = MOD09GQ.A2017224.h09v02.006.2017227165020.hdf.met;\n", "");
    let err = parser().parse(&text).await.unwrap_err();

    assert_eq!(err.name(), "InvalidPdrError");
    assert!(err.to_string().contains("FILE_ID"));
}

#[tokio::test]
async fn test_checksum_type_without_value() {
    let text = MOD09GQ_PDR.replace("    FILE_CKSUM_VALUE = 4208254019;\n", "");
    let err = parser().parse(&text).await.unwrap_err();
    assert_eq!(err.name(), "InvalidPdrError");
}

#[tokio::test]
async fn test_non_numeric_file_size() {
    let text = MOD09GQ_PDR.replace("FILE_SIZE = 44118;", "FILE_SIZE = big;");
    let err = parser().parse(&text).await.unwrap_err();
    assert_eq!(err.name(), "InvalidPdrError");
}

#[tokio::test]
async fn test_unknown_collection() {
    let text = MOD09GQ_PDR.replace("DATA_TYPE = MOD09GQ;", "DATA_TYPE = MOD14A1;");
    let err = parser().parse(&text).await.unwrap_err();
    assert_eq!(err.name(), "CollectionNotFound");
}

#[tokio::test]
async fn test_no_file_groups() {
    let err = parser().parse("ORIGINATING_SYSTEM = GSFC;\n").await.unwrap_err();
    assert_eq!(err.name(), "InvalidPdrError");
}

// ============================================================================
// Provider round trip
// ============================================================================

#[tokio::test]
async fn test_parse_from_provider_archives_first() {
    let store = Arc::new(InMemoryObjectStore::new());
    let broken = MOD09GQ_PDR.replace("END_OBJECT = FILE_GROUP;", "");
    let mut mock = MockProvider::new()
        .with_file("/pdrs", "good.PDR", MOD09GQ_PDR)
        .with_file("/pdrs", "broken.PDR", broken.as_str());

    let good = parser()
        .parse_from_provider(&mut mock, &DiscoveredFile::new("good.PDR", "/pdrs"), store.as_ref(), "granary-internal", "granary")
        .await
        .unwrap();
    assert_eq!(good.granules_count, 1);

    let err = parser()
        .parse_from_provider(&mut mock, &DiscoveredFile::new("broken.PDR", "/pdrs"), store.as_ref(), "granary-internal", "granary")
        .await
        .unwrap_err();
    assert_eq!(err.name(), "InvalidPdrError");

    for name in ["good.PDR", "broken.PDR"] {
        assert!(store
            .exists("granary-internal", &pdr_archive_key("granary", name))
            .await
            .unwrap());
    }

    let pdrd = pan::pdrd(&err.to_string());
    assert!(pdrd.starts_with("MESSAGE_TYPE = SHORTPDRD;\nDISPOSITION = \"Invalid PDR"));
}
