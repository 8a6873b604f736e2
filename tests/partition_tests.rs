//! End-to-end scenarios over on-disk partitions: range evaluation, RID
//! resolution, masks, headers, backup maintenance, and self-tests.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use partdb::config::Config;
use partdb::part::header::{self, HeaderInfo, PartState, MASK_FILE};
use partdb::part::lifecycle::{verify_backup, wait_for_background_tasks};
use partdb::part::{ColType, Column, Partition};
use partdb::scan::predicate::{Expr, Op};
use partdb::{
    AnyAnyPred, ArithPred, Bitmap, Evaluator, FileManager, PredNode, RangePred, Rid, StringPred,
};

#[test]
fn evaluate_half_open_range() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);

    // 3 <= x < 7 over x = 1..=10
    let range = RangePred::half_open("x", 3.0, 7.0);
    let hits = eval.evaluate(&range.clone().into()).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    assert_eq!(hits.count(), 4);

    let (low, high) = eval.estimate(&range).unwrap();
    assert!(low.is_subset(&hits));
    assert!(hits.is_subset(&high));
    assert!(eval.estimate_count(&range) >= 4);
}

#[test]
fn equality_and_negation() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);

    let range = RangePred::equals("x", 5.0);
    let hits = eval.evaluate(&range.clone().into()).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![4]);

    let mask = part.active_mask();
    let misses = eval.negative_scan(&range, &mask).unwrap();
    assert_eq!(
        misses.iter().collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 5, 6, 7, 8, 9]
    );
    // complement within the active mask, and disjoint
    let mut union = hits.clone();
    union.or(&misses);
    assert_eq!(union, mask);
    let mut overlap = hits;
    overlap.and(&misses);
    assert!(overlap.is_empty());
}

#[test]
fn popcount_matches_counting_scan() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);
    for (lo, hi) in [(0.0, 11.0), (2.5, 7.5), (5.0, 5.0), (9.0, 100.0)] {
        let range = RangePred::between("x", lo, hi);
        let hits = eval.evaluate(&range.clone().into()).unwrap();
        assert_eq!(hits.count() as u64, eval.count_hits(&range).unwrap());
    }
}

#[test]
fn recursive_split_counts_add_up() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (0..500).map(|i| (i % 83) as f64 * 0.5).collect();
    write_f64_column(dir.path(), "v", &values);
    write_basic_header(dir.path(), "splits", 500, &[("v", ColType::Double)]);
    let part = open_partition(dir.path());
    let eval = Evaluator::new(&part);
    for (a, b, c) in [(0.0, 10.0, 45.0), (1.0, 2.0, 3.0), (0.0, 20.5, 41.5)] {
        let whole = eval.count_hits(&RangePred::half_open("v", a, c)).unwrap();
        let left = eval.count_hits(&RangePred::half_open("v", a, b)).unwrap();
        let right = eval.count_hits(&RangePred::half_open("v", b, c)).unwrap();
        assert_eq!(whole, left + right, "split at {} of [{}, {})", b, a, c);
    }
}

#[test]
fn missing_column_yields_empty_bitmap() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);
    let hits = eval
        .evaluate(&RangePred::between("nosuch", 0.0, 1.0).into())
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(hits.size(), 10);
}

#[test]
fn declared_count_mismatch_keeps_observed() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=5).collect();
    write_i32_column(dir.path(), "a", &values);
    write_i32_column(dir.path(), "b", &values);
    std::fs::write(
        dir.path().join("-part.txt"),
        [
            "BEGIN HEADER",
            "Name = \"mismatch\"",
            "Number_of_rows = 5",
            "Number_of_columns = 3",
            "Timestamp = 1",
            "State = 0",
            "END HEADER",
            "Begin Column",
            "name = \"a\"",
            "data_type = INT",
            "End Column",
            "Begin Column",
            "name = \"b\"",
            "data_type = INT",
            "End Column",
        ]
        .join("\n"),
    )
    .unwrap();
    let part = open_partition(dir.path());
    assert_eq!(part.ncols(), 2);
    let eval = Evaluator::new(&part);
    let hits = eval
        .evaluate(&RangePred::between("c", 0.0, 9.0).into())
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn compound_predicates_combine_with_bitmap_algebra() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);
    // (x < 4) OR (x >= 9): rows 0,1,2,8,9
    let pred = PredNode::from(RangePred::new("x", 4.0, Op::Gt, Op::None, 0.0))
        .or(RangePred::new("x", 9.0, Op::Le, Op::None, 0.0).into());
    let hits = eval.evaluate(&pred).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 1, 2, 8, 9]);
    // NOT (3 <= x < 7) within the mask
    let not = PredNode::from(RangePred::half_open("x", 3.0, 7.0)).not();
    let hits = eval.evaluate(&not).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 1, 6, 7, 8, 9]);
}

#[test]
fn arithmetic_predicate_pulls_rows_through_barrel() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let x: Vec<i32> = (1..=6).collect();
    let y: Vec<f64> = vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
    write_i32_column(dir.path(), "x", &x);
    write_f64_column(dir.path(), "y", &y);
    write_basic_header(
        dir.path(),
        "arith",
        6,
        &[("x", ColType::Int), ("y", ColType::Double)],
    );
    let part = open_partition(dir.path());
    let eval = Evaluator::new(&part);
    // 4 <= x + 2*y < 9 -> sums are 2,4,6,8,10,12 -> rows 1,2,3
    let expr = Expr::Add(
        Box::new(Expr::Col("x".to_string())),
        Box::new(Expr::Mul(
            Box::new(Expr::Const(2.0)),
            Box::new(Expr::Col("y".to_string())),
        )),
    );
    let pred = ArithPred::new(expr, 4.0, Op::Le, Op::Lt, 9.0);
    let hits = eval.evaluate(&PredNode::Arith(pred)).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn match_any_over_prefixed_columns() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_i32_column(dir.path(), "adc1", &[1, 2, 3, 4]);
    write_i32_column(dir.path(), "adc2", &[4, 3, 2, 1]);
    write_i32_column(dir.path(), "tdc1", &[9, 9, 9, 9]);
    write_basic_header(
        dir.path(),
        "prefixed",
        4,
        &[
            ("adc1", ColType::Int),
            ("adc2", ColType::Int),
            ("tdc1", ColType::Int),
        ],
    );
    let part = open_partition(dir.path());
    let eval = Evaluator::new(&part);
    // any adc* equal to 4: row 3 (adc1) and row 0 (adc2)
    let pred = AnyAnyPred::new("ADC", vec![4.0]);
    let hits = eval.match_any(&pred, &part.active_mask()).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 3]);
}

#[test]
fn string_lookup_tries_both_sides() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_category_column(
        dir.path(),
        "fruit",
        &["apple", "banana"],
        &[1, 2, 1, 2, 1],
    );
    write_basic_header(dir.path(), "cat", 5, &[("fruit", ColType::Category)]);
    let part = open_partition(dir.path());
    let eval = Evaluator::new(&part);
    let hits = eval
        .lookfor_string(&StringPred::new("fruit", "apple"))
        .unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 2, 4]);
    // reversed literal order resolves through the right side
    let hits = eval
        .lookfor_string(&StringPred::new("banana", "fruit"))
        .unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1, 3]);
}

#[test]
fn text_search_and_keyword_search() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_text_column(dir.path(), "msg", &["alpha", "beta", "alphabet", "gamma"]);
    write_basic_header(dir.path(), "texts", 4, &[("msg", ColType::Text)]);
    let part = open_partition(dir.path());
    let col = part.column("msg").unwrap();
    let hits = col.search(part.ctx(), "alpha").unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0]);
    let hits = col.keyword_search(part.ctx(), "alpha").unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 2]);
    // numeric ranges on text columns address row numbers
    let eval = Evaluator::new(&part);
    let hits = eval
        .evaluate(&RangePred::between("msg", 1.0, 2.0).into())
        .unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1, 2]);
}

// ---- row identifiers --------------------------------------------------

#[test]
fn sorted_rid_search_scenario() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=5).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "with_rids", 5, &[("x", ColType::Int)]);
    let rids = vec![
        Rid::new(0, 0),
        Rid::new(0, 1),
        Rid::new(0, 2),
        Rid::new(1, 0),
        Rid::new(1, 1),
    ];
    partdb::rid::write_rids(dir.path(), &rids).unwrap();
    let part = open_partition(dir.path());
    let eval = Evaluator::new(&part);

    let mut query = vec![Rid::new(1, 0), Rid::new(0, 2)];
    query.sort();
    let mut out = Bitmap::new(5);
    eval.search_sorted_rids(&query, &mut out).unwrap();
    assert_eq!(out.iter().collect::<Vec<_>>(), vec![2, 3]);

    let hits = eval.evaluate_rid_set(&[Rid::new(1, 0), Rid::new(0, 2)]).unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![2, 3]);

    // round-trip: every stored RID resolves to its row
    for (row, &rid) in rids.iter().enumerate() {
        assert_eq!(eval.get_row_number(rid), row);
    }
    assert_eq!(eval.get_row_number(Rid::new(7, 7)), 5);
}

#[test]
fn rid_set_without_rids_uses_row_positions() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);
    let hits = eval
        .evaluate_rid_set(&[Rid::new(0, 3), Rid::new(0, 7), Rid::new(0, 99)])
        .unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![3, 7]);
}

#[test]
fn rids_are_synthesized_when_configured() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..6).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "gen", 6, &[("x", ColType::Int)]);
    let config = Config::from_pairs([("gen.fillRIDs", "true")]);
    let part = Partition::from_dir(dir.path(), &config, FileManager::new()).unwrap();
    let rids = part.rids().expect("rids should be synthesized");
    assert_eq!(rids.len(), 6);
    assert!(rids.iter().enumerate().all(|(i, r)| r.event() == i as u32));
    assert!(dir.path().join("rids").exists());
    assert!(dir.path().join("rids.srt").exists());
}

#[test]
fn sorted_rid_file_regenerates_when_wrong_sized() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=4).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "regen", 4, &[("x", ColType::Int)]);
    let rids: Vec<Rid> = (0..4).map(|i| Rid::new(2, i as u32)).collect();
    partdb::rid::write_rids(dir.path(), &rids).unwrap();
    std::fs::write(dir.path().join("rids.srt"), b"short").unwrap();

    let part = open_partition(dir.path());
    part.sort_rids().unwrap();
    assert_eq!(
        std::fs::metadata(dir.path().join("rids.srt")).unwrap().len(),
        4 * 12
    );
    let eval = Evaluator::new(&part);
    assert_eq!(eval.get_row_number(Rid::new(2, 3)), 3);
}

// ---- masks ------------------------------------------------------------

#[test]
fn full_mask_file_is_removed_on_open() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=8).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "full", 8, &[("x", ColType::Int)]);
    Bitmap::ones(8).write_to(&dir.path().join(MASK_FILE)).unwrap();
    let part = open_partition(dir.path());
    assert_eq!(part.active_rows(), 8);
    assert!(!dir.path().join(MASK_FILE).exists());
}

#[test]
fn partial_mask_restricts_scans_and_persists() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=8).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "masked", 8, &[("x", ColType::Int)]);
    {
        let part = open_partition(dir.path());
        let mut dead = Bitmap::new(8);
        dead.set(0);
        dead.set(5);
        part.deactivate_rows(&dead).unwrap();
        assert_eq!(part.active_rows(), 6);
    }
    assert!(dir.path().join(MASK_FILE).exists());
    let part = open_partition(dir.path());
    assert_eq!(part.active_rows(), 6);
    let eval = Evaluator::new(&part);
    // x between 1 and 8, but rows 0 and 5 are inactive
    let hits = eval
        .evaluate(&RangePred::between("x", 1.0, 8.0).into())
        .unwrap();
    assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 6, 7]);
}

#[test]
fn wrong_sized_mask_is_repaired() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (1..=8).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "repair", 8, &[("x", ColType::Int)]);
    // mask of the wrong length with one cleared bit
    let mut short = Bitmap::ones(5);
    short.unset(2);
    short.write_to(&dir.path().join(MASK_FILE)).unwrap();
    let part = open_partition(dir.path());
    assert_eq!(part.active_mask().size(), 8);
    assert_eq!(part.active_rows(), 7);
}

// ---- header and lifecycle ---------------------------------------------

#[test]
fn header_roundtrip_through_partition() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..12).collect();
    write_i32_column(dir.path(), "x", &values);
    let info = HeaderInfo {
        name: "rt".to_string(),
        description: "roundtrip".to_string(),
        rows: 12,
        timestamp: 42,
        state: PartState::Stable,
        meta_tags: vec![("production".to_string(), "mc09".to_string())],
        shape: Some(vec![
            partdb::part::MeshDim {
                name: Some("i".to_string()),
                size: 3,
            },
            partdb::part::MeshDim {
                name: None,
                size: 4,
            },
        ]),
        index_spec: "equality".to_string(),
        columns: vec![Arc::new(Column::new("x", ColType::Int))],
        ..HeaderInfo::default()
    };
    header::write_header(dir.path(), &info).unwrap();
    let part = open_partition(dir.path());
    assert_eq!(part.name(), "rt");
    assert_eq!(part.description(), "roundtrip");
    assert_eq!(part.nrows(), 12);
    assert_eq!(part.state(), PartState::Stable);
    assert_eq!(part.switch_time(), 42);
    assert_eq!(part.shape().unwrap().len(), 2);
    assert!(part.matches_meta_tags(&[("Production".to_string(), "MC09".to_string())]));
    // the meta tag is visible as a single-value category column
    let eval = Evaluator::new(&part);
    let hits = eval
        .lookfor_string(&StringPred::new("production", "mc09"))
        .unwrap();
    assert_eq!(hits.count(), 12);

    // mutate and rewrite; the new header must read back identically
    part.rename("rt2").unwrap();
    part.set_state(PartState::PreTransition).unwrap();
    let part = open_partition(dir.path());
    assert_eq!(part.name(), "rt2");
    assert_eq!(part.state(), PartState::PreTransition);
    assert_eq!(part.index_spec(), "equality");
}

#[test]
fn from_meta_tags_builds_directory_name() {
    let _ = env_logger::try_init();
    let base = tempfile::tempdir().unwrap();
    let config = Config::from_pairs([("dataDir", base.path().to_str().unwrap())]);
    let tags = vec![
        ("trgSetupName".to_string(), "ppProduction".to_string()),
        ("production".to_string(), "P09ic".to_string()),
        ("magScale".to_string(), "FullField".to_string()),
    ];
    let part = Partition::from_meta_tags(&tags, &config, FileManager::new()).unwrap();
    assert!(base.path().join("ppProduction_P09ic_FullField").is_dir());
    assert_eq!(part.meta_tags().len(), 3);
    assert!(part.matches_meta_tags(&tags));
}

#[test]
fn backup_copy_ends_stable() {
    let _ = env_logger::try_init();
    let base = tempfile::tempdir().unwrap();
    let active = base.path().join("events1");
    std::fs::create_dir(&active).unwrap();
    let values: Vec<i32> = (1..=10).collect();
    write_i32_column(&active, "x", &values);
    write_basic_header(&active, "events", 10, &[("x", ColType::Int)]);

    let config = Config::from_pairs([("table.events.useBackupDir", "1")]);
    let part = Partition::from_dir(&active, &config, FileManager::new()).unwrap();
    let backup = part.backup_dir().expect("backup dir derived");
    assert_eq!(backup, base.path().join("events2"));

    wait_for_background_tasks();
    assert!(backup.join("-part.txt").exists());
    assert!(backup.join("x").exists());
    assert!(verify_backup(&part).unwrap());
    assert_eq!(part.state(), PartState::Stable);

    // a second open against the same pair finds the backup consistent
    let part = Partition::from_dir(&active, &config, FileManager::new()).unwrap();
    wait_for_background_tasks();
    assert!(verify_backup(&part).unwrap());
}

#[test]
fn construction_failure_leaves_no_state() {
    let _ = env_logger::try_init();
    let base = tempfile::tempdir().unwrap();
    let dir = base.path().join("nested").join("broken");
    // a directory that exists but holds garbage instead of a header
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("junk"), b"not a partition").unwrap();
    let err = Partition::from_dir(&dir, &Config::new(), FileManager::new()).unwrap_err();
    assert!(matches!(err, partdb::PartError::HeaderNotFound(_)));
    // a path we created ourselves is cleaned up again on failure
    let fresh = base.path().join("fresh");
    assert!(Partition::from_dir(&fresh, &Config::new(), FileManager::new()).is_ok());
}

// ---- selection --------------------------------------------------------

#[test]
fn typed_selection_lengths_follow_mask() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let col = part.column("x").unwrap();
    let mut mask = Bitmap::new(10);
    for i in [0, 4, 9] {
        mask.set(i);
    }
    let ints = col.select_ints(part.ctx(), &mask).unwrap();
    assert_eq!(ints, vec![1, 5, 10]);
    let longs = col.select_longs(part.ctx(), &mask).unwrap();
    assert_eq!(longs, vec![1, 5, 10]);
    let doubles = col.select_doubles(part.ctx(), &mask).unwrap();
    assert_eq!(doubles, vec![1.0, 5.0, 10.0]);
    // floats are not selectable from a 4-byte integer column
    assert!(col.select_floats(part.ctx(), &mask).is_err());
}

#[test]
fn cached_array_scans_match_file_scans() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let eval = Evaluator::new(&part);
    let range = RangePred::half_open("x", 3.0, 7.0);
    let from_file = eval.evaluate(&range.clone().into()).unwrap();

    // pin the column in memory; the scan switches to the array source
    let col = part.column("x").unwrap();
    col.load_data(part.ctx()).unwrap();
    let from_array = eval.evaluate(&range.clone().into()).unwrap();
    assert_eq!(from_file, from_array);
    col.free_data();
}

// ---- self test and index building -------------------------------------

#[test]
fn self_test_passes_on_consistent_partition() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (0..400).map(|i| (i % 59) as f64).collect();
    write_f64_column(dir.path(), "v", &values);
    write_basic_header(dir.path(), "ok", 400, &[("v", ColType::Double)]);
    let part = open_partition(dir.path());
    let opts = partdb::selftest::SelfTestOptions {
        threads: 2,
        nqueries: 16,
        ..Default::default()
    };
    assert_eq!(partdb::selftest::self_test(&part, &opts), 0);
    assert_eq!(part.error_count(), 0);
}

#[test]
fn self_test_flags_truncated_column_file() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..100).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "bad", 100, &[("x", ColType::Int)]);
    let part = open_partition(dir.path());
    // chop the data file after the partition is open
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("x"))
        .unwrap();
    file.set_len(100).unwrap();
    let opts = partdb::selftest::SelfTestOptions {
        threads: 1,
        nqueries: 4,
        ..Default::default()
    };
    assert!(partdb::selftest::self_test(&part, &opts) > 0);
    assert!(part.error_count() > 0);
}

#[test]
fn index_builder_builds_and_header_records_spec() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let x: Vec<i32> = (0..200).map(|i| i % 7).collect();
    let y: Vec<f64> = (0..200).map(|i| (i % 13) as f64).collect();
    write_i32_column(dir.path(), "x", &x);
    write_f64_column(dir.path(), "y", &y);
    write_basic_header(
        dir.path(),
        "indexed",
        200,
        &[("x", ColType::Int), ("y", ColType::Double)],
    );
    let part = open_partition(dir.path());
    assert_eq!(partdb::index_builder::build_indexes(&part, "equality", 3), 0);
    assert!(dir.path().join("x.idx").exists());
    assert!(dir.path().join("y.idx").exists());
    // bounds were computed along the way
    assert_eq!(part.column("x").unwrap().bounds(), Some((0.0, 6.0)));

    // reload the index from its file and answer through it
    let col = part.column("x").unwrap();
    col.load_index(part.ctx(), "equality").unwrap();
    assert!(col.has_index());
    let eval = Evaluator::new(&part);
    let range = RangePred::equals("x", 3.0);
    let hits = eval.evaluate(&range.clone().into()).unwrap();
    assert_eq!(hits.count() as u64, eval.count_hits(&range).unwrap());
    col.purge_index_file(part.ctx()).unwrap();
    assert!(!dir.path().join("x.idx").exists());
}

#[test]
fn estimates_bracket_with_index() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (0..5000).map(|i| (i as f64).sqrt()).collect();
    write_f64_column(dir.path(), "v", &values);
    write_basic_header(dir.path(), "bracket", 5000, &[("v", ColType::Double)]);
    let part = open_partition(dir.path());
    let col = part.column("v").unwrap();
    col.load_index(part.ctx(), "bins").unwrap();
    let eval = Evaluator::new(&part);
    let range = RangePred::half_open("v", 10.0, 33.3);
    let hits = eval.evaluate(&range.clone().into()).unwrap();
    let (low, high) = eval.estimate(&range).unwrap();
    assert!(low.is_subset(&hits));
    assert!(hits.is_subset(&high));
}

#[test]
fn undecidable_rows_and_cost_hints() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let col = part.column("x").unwrap();
    let range = RangePred::half_open("x", 3.0, 7.0);
    assert!(col.estimate_cost(part.ctx(), &range) > 0.0);

    // without an index everything in range is undecidable
    let mut iffy = Bitmap::new(0);
    let frac = col.undecidable(part.ctx(), &range, &mut iffy);
    assert!(frac > 0.0 && frac <= 1.0);

    // an exact index leaves nothing undecidable
    col.load_index(part.ctx(), "equality").unwrap();
    let frac = col.undecidable(part.ctx(), &range, &mut iffy);
    assert_eq!(frac, 0.0);
    assert!(iffy.is_empty());
}

#[test]
fn column_null_mask_defaults_and_reads() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let col = part.column("x").unwrap();
    // no mask file: every row is valid
    assert_eq!(col.null_mask(part.ctx()).count(), 10);
    let mut nulls = Bitmap::ones(10);
    nulls.unset(3);
    nulls.write_to(&dir.path().join("x.msk")).unwrap();
    let mask = col.null_mask(part.ctx());
    assert_eq!(mask.count(), 9);
    assert!(!mask.is_set(3));
}

#[test]
fn cleaner_releases_cached_state_under_pressure() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..16).collect();
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "pressure", 16, &[("x", ColType::Int)]);
    let fm = FileManager::new();
    let part = Partition::from_dir(dir.path(), &Config::new(), fm.clone()).unwrap();
    let col = part.column("x").unwrap();
    col.load_index(part.ctx(), "equality").unwrap();
    col.load_data(part.ctx()).unwrap();
    assert!(col.has_index());
    fm.unload(4);
    assert!(!col.has_index());
}

#[test]
fn csr_export_writes_index_dump() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let csr_dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = vec![1, 2, 1, 3];
    write_i32_column(dir.path(), "x", &values);
    write_basic_header(dir.path(), "csr", 4, &[("x", ColType::Int)]);
    let config = Config::from_pairs([(
        "exportBitmapAsCsr",
        csr_dir.path().to_str().unwrap(),
    )]);
    let part = Partition::from_dir(dir.path(), &config, FileManager::new()).unwrap();
    part.column("x")
        .unwrap()
        .load_index(part.ctx(), "equality")
        .unwrap();
    let dump = csr_dir.path().join("x.csr");
    assert!(dump.exists());
    let text = std::fs::read_to_string(dump).unwrap();
    assert!(text.lines().count() >= 2);
}
