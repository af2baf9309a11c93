//! Bulk (ALL-mode) refresh scenarios.

mod common;

use common::{decode_i32s, write_rows, TestEnv};
use std::collections::BTreeMap;
use strata_common::{ChunkKey, ElementType, Error, ScalarType};
use strata_foreign::refresh_foreign_table;

fn options(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn bulk_refresh_replaces_data() {
    let env = TestEnv::with_cache();
    let file = env.data_path("refresh_tmp.csv");
    write_rows(&file, &["1", "2"]);
    let table = env.create_delimited_table(
        "refresh_tmp",
        &[("i", ElementType::Scalar(ScalarType::Int))],
        &file,
        &[("fragment_size", "1")],
    );

    // Populate the cache with both fragments
    assert_eq!(env.table_metadata(&table).len(), 2);
    let frag0 = ChunkKey::data(1, table.id, 1, 0);
    let frag1 = ChunkKey::data(1, table.id, 1, 1);
    assert_eq!(decode_i32s(env.fetch(&frag0).as_slice()), vec![1]);
    assert_eq!(decode_i32s(env.fetch(&frag1).as_slice()), vec![2]);

    // Grow the file; cached results must not change until the refresh
    write_rows(&file, &["1", "2", "3", "4", "5"]);
    assert_eq!(decode_i32s(env.fetch(&frag0).as_slice()), vec![1]);

    let metadata_before = env.cache().num_metadata_added();
    let chunks_before = env.cache().num_chunks_added();
    refresh_foreign_table(&env.catalog, &env.mgr, "refresh_tmp", &options(&[])).unwrap();

    // All five metadata records are recached; only the two previously
    // cached chunks are eagerly re-populated
    assert_eq!(env.cache().num_metadata_added() - metadata_before, 5);
    assert_eq!(env.cache().num_chunks_added() - chunks_before, 2);
    assert!(env.cache().get_cached_chunk_if_exists(&frag0).is_some());
    assert!(env.cache().get_cached_chunk_if_exists(&frag1).is_some());

    // A full scan brings in the remaining three chunks
    for fragment_id in 0..5 {
        let key = ChunkKey::data(1, table.id, 1, fragment_id);
        let chunk = env.fetch(&key);
        assert_eq!(decode_i32s(chunk.as_slice()), vec![fragment_id + 1]);
    }
    assert_eq!(env.cache().num_metadata_added() - metadata_before, 5);
    assert_eq!(env.cache().num_chunks_added() - chunks_before, 5);

    // Manual refresh bookkeeping: last refresh stamped, nothing scheduled
    let times = table.refresh_times();
    assert!(times.last_refresh_time.is_some());
    assert_eq!(times.next_refresh_time, None);
}

#[test]
fn refresh_with_evict_clears_the_table() {
    let env = TestEnv::with_cache();
    let file = env.data_path("evict.csv");
    write_rows(&file, &["0"]);
    let table = env.create_delimited_table(
        "evict_me",
        &[("i", ElementType::Scalar(ScalarType::Int))],
        &file,
        &[],
    );
    env.table_metadata(&table);
    let key = ChunkKey::data(1, table.id, 1, 0);
    assert_eq!(decode_i32s(env.fetch(&key).as_slice()), vec![0]);

    write_rows(&file, &["1"]);
    refresh_foreign_table(
        &env.catalog,
        &env.mgr,
        "evict_me",
        &options(&[("evict", "true")]),
    )
    .unwrap();

    // Nothing cached under the prefix afterwards
    assert!(env.cache().get_cached_chunk_if_exists(&key).is_none());
    assert!(!env.cache().is_metadata_cached(&key));

    // The next scan sees the new file, reproducing what a fresh first
    // population would have returned
    env.table_metadata(&table);
    assert_eq!(decode_i32s(env.fetch(&key).as_slice()), vec![1]);
}

#[test]
fn refresh_option_errors() {
    let env = TestEnv::with_cache();
    let file = env.data_path("opts.csv");
    write_rows(&file, &["0"]);
    env.create_delimited_table(
        "opts",
        &[("i", ElementType::Scalar(ScalarType::Int))],
        &file,
        &[],
    );

    let err = refresh_foreign_table(
        &env.catalog,
        &env.mgr,
        "opts",
        &options(&[("evict", "invalid")]),
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid value \"invalid\" provided for EVICT option. \
         Value must be either \"true\" or \"false\"."
    );

    let err = refresh_foreign_table(
        &env.catalog,
        &env.mgr,
        "opts",
        &options(&[("invalid_key", "false")]),
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid option \"INVALID_KEY\" provided for refresh command. \
         Only \"EVICT\" option is supported."
    );
}

#[test]
fn schema_change_fails_before_eviction() {
    let env = TestEnv::with_cache();
    let file = env.data_path("schema.csv");
    write_rows(&file, &["1"]);
    let table = env.create_delimited_table(
        "narrow",
        &[("i", ElementType::Scalar(ScalarType::Int))],
        &file,
        &[],
    );
    env.table_metadata(&table);
    let key = ChunkKey::data(1, table.id, 1, 0);
    let before = env.fetch(&key);

    // The file now carries two columns; the metadata rescan fails before
    // anything is evicted
    write_rows(&file, &["3,4"]);
    let err =
        refresh_foreign_table(&env.catalog, &env.mgr, "narrow", &options(&[])).unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch { .. }));
    assert!(err
        .to_string()
        .contains("Mismatched number of logical columns"));
    assert!(err.preserves_cache());

    // Cached data is intact
    assert!(env.cache().is_metadata_cached(&key));
    assert_eq!(env.fetch(&key).as_slice(), before.as_slice());
}

#[test]
fn refresh_reaches_every_column() {
    let env = TestEnv::with_cache();
    let file = env.data_path("two_col.csv");
    write_rows(&file, &["1,2"]);
    let table = env.create_delimited_table(
        "two_col",
        &[
            ("i", ElementType::Scalar(ScalarType::Int)),
            ("i2", ElementType::Scalar(ScalarType::Int)),
        ],
        &file,
        &[],
    );
    env.table_metadata(&table);
    let col1 = ChunkKey::data(1, table.id, 1, 0);
    let col2 = ChunkKey::data(1, table.id, 2, 0);
    env.fetch(&col1);
    env.fetch(&col2);

    write_rows(&file, &["3,4"]);
    refresh_foreign_table(&env.catalog, &env.mgr, "two_col", &options(&[])).unwrap();

    assert_eq!(decode_i32s(env.fetch(&col1).as_slice()), vec![3]);
    assert_eq!(decode_i32s(env.fetch(&col2).as_slice()), vec![4]);
}
