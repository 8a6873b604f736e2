//! Histogram and distribution scenarios.

mod common;

use pretty_assertions::assert_eq;

use common::*;
use partdb::part::ColType;
use partdb::{Evaluator, HistogramEngine, PredNode, RangePred};

#[test]
fn one_dimensional_histogram() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    // x = 1..=10 binned from 0 to 10 by 2: lengths 1 + floor(10/2) = 6
    let counts = hist.hist_1d(None, "x", 0.0, 10.0, 2.0).unwrap();
    assert_eq!(counts, vec![1, 2, 2, 2, 2, 1]);
    assert_eq!(counts.iter().sum::<u64>(), 10);
    // reversed direction is rejected
    assert!(hist.hist_1d(None, "x", 10.0, 0.0, 2.0).is_err());
    assert!(hist.hist_1d(None, "x", 0.0, 10.0, 0.0).is_err());
}

#[test]
fn one_dimensional_histogram_with_constraint() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let constraint = PredNode::from(RangePred::greater_than("x", 4.0));
    let counts = hist
        .hist_1d(Some(&constraint), "x", 0.0, 10.0, 5.0)
        .unwrap();
    // x in {5..10}: bins [0,5) -> 0, [5,10) -> 5, [10,15) -> 1
    assert_eq!(counts, vec![0, 5, 1]);
}

#[test]
fn two_dimensional_histogram_scenario() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_i32_column(dir.path(), "x", &[1, 3, 6, 9]);
    write_i32_column(dir.path(), "y", &[1, 3, 0, 2]);
    write_basic_header(
        dir.path(),
        "grid",
        4,
        &[("x", ColType::Int), ("y", ColType::Int)],
    );
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let constraint = PredNode::from(RangePred::greater_than("x", 0.0));
    let counts = hist
        .hist_2d(Some(&constraint), "x", 0.0, 10.0, 5.0, "y", 0.0, 4.0, 2.0)
        .unwrap();
    assert_eq!(counts.len(), 4);
    assert_eq!(counts, vec![1, 1, 1, 1]);
}

#[test]
fn histogram_totals_match_box_popcount() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let x: Vec<i64> = (0..300).map(|i| (i * 7) % 50).collect();
    let y: Vec<f64> = (0..300).map(|i| ((i * 13) % 29) as f64 / 2.0).collect();
    write_i64_column(dir.path(), "x", &x);
    write_f64_column(dir.path(), "y", &y);
    write_basic_header(
        dir.path(),
        "totals",
        300,
        &[("x", ColType::Long), ("y", ColType::Double)],
    );
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let constraint = PredNode::from(RangePred::greater_than("x", 5.0));
    let counts = hist
        .hist_2d(Some(&constraint), "x", 10.0, 40.0, 6.0, "y", 1.0, 9.0, 2.5)
        .unwrap();
    // the histogram covers exactly the constraint ∧ box conjunction
    let eval = Evaluator::new(&part);
    let boxed = constraint
        .clone()
        .and(RangePred::half_open("x", 10.0, 40.0).into())
        .and(RangePred::half_open("y", 1.0, 9.0).into());
    let expected = eval.evaluate(&boxed).unwrap().count() as u64;
    assert_eq!(counts.iter().sum::<u64>(), expected);
}

#[test]
fn three_dimensional_histogram_addressing() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    write_i32_column(dir.path(), "a", &[0, 1, 0, 1]);
    write_i32_column(dir.path(), "b", &[0, 0, 1, 1]);
    write_i32_column(dir.path(), "c", &[0, 1, 1, 0]);
    write_basic_header(
        dir.path(),
        "cube",
        4,
        &[("a", ColType::Int), ("b", ColType::Int), ("c", ColType::Int)],
    );
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let counts = hist
        .hist_3d(
            None, "a", 0.0, 2.0, 1.0, "b", 0.0, 2.0, 1.0, "c", 0.0, 2.0, 1.0,
        )
        .unwrap();
    assert_eq!(counts.len(), 8);
    // (a,b,c) -> index (a*2 + b)*2 + c
    let mut expected = vec![0u64; 8];
    for (a, b, c) in [(0, 0, 0), (1, 0, 1), (0, 1, 1), (1, 1, 0)] {
        expected[(a * 2 + b) * 2 + c] += 1;
    }
    assert_eq!(counts, expected);
}

#[test]
fn distribution_of_few_distinct_values() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    // distinct values 1..=5, each 100 times
    let values: Vec<i32> = (0..500).map(|i| (i % 5) + 1).collect();
    write_i32_column(dir.path(), "y", &values);
    write_basic_header(dir.path(), "dist", 500, &[("y", ColType::Int)]);
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let (bounds, counts) = hist.get_distribution("y", None, None).unwrap();
    assert_eq!(bounds, vec![2.0, 3.0, 4.0, 5.0]);
    assert_eq!(counts, vec![100, 100, 100, 100, 100]);
}

#[test]
fn distribution_of_single_value() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = vec![7; 42];
    write_i32_column(dir.path(), "y", &values);
    write_basic_header(dir.path(), "single", 42, &[("y", ColType::Int)]);
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let (bounds, counts) = hist.get_distribution("y", None, None).unwrap();
    assert_eq!(bounds, vec![7.0, 8.0]);
    assert_eq!(counts, vec![0, 42, 0]);
}

#[test]
fn distribution_honors_supplied_bounds() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let part = ten_row_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let (bounds, counts) = hist
        .get_distribution("x", None, Some(&[3.0, 7.0]))
        .unwrap();
    assert_eq!(bounds, vec![3.0, 7.0]);
    // x = 1..=10: below 3 -> {1,2}; [3,7) -> {3,4,5,6}; >= 7 -> {7..10}
    assert_eq!(counts, vec![2, 4, 4]);
}

#[test]
fn cumulative_distribution_is_prefix_summed() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..300).map(|i| (i % 3) + 1).collect();
    write_i32_column(dir.path(), "y", &values);
    write_basic_header(dir.path(), "cdf", 300, &[("y", ColType::Int)]);
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let (bounds, counts) = hist.get_cumulative_distribution("y", None).unwrap();
    assert_eq!(bounds.len(), counts.len());
    assert_eq!(counts.first(), Some(&0));
    assert_eq!(counts.last(), Some(&300));
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    // the final boundary lies strictly above the maximum value
    assert!(*bounds.last().unwrap() > 3.0);
    // counts[i] is the number of values strictly below bounds[i]
    assert_eq!(bounds[0], 1.0);
    assert_eq!(counts[1], 100);
    assert_eq!(counts[2], 200);
}

#[test]
fn packed_distribution_fits_requested_bins() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<i32> = (0..400).map(|i| i % 40).collect();
    write_i32_column(dir.path(), "y", &values);
    write_basic_header(dir.path(), "packed", 400, &[("y", ColType::Int)]);
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);

    // natural output has 40 counts; packing to 50 copies verbatim
    let (natural_bounds, natural_counts) = hist.get_distribution("y", None, None).unwrap();
    let (bounds, counts) = hist.pack_distribution("y", None, 50).unwrap();
    assert_eq!(bounds, natural_bounds);
    assert_eq!(counts, natural_counts);

    // packing to 8 merges interior bins toward equal row counts
    let (bounds, counts) = hist.pack_distribution("y", None, 8).unwrap();
    assert!(counts.len() <= 8);
    assert_eq!(bounds.len(), counts.len() - 1);
    assert_eq!(counts.iter().sum::<u64>(), 400);
    assert_eq!(bounds.first(), natural_bounds.first());
    assert_eq!(bounds.last(), natural_bounds.last());
    // interior bins are near the equi-count target
    for &c in &counts[1..counts.len() - 1] {
        assert!(c >= 40 && c <= 120, "bin of {} rows", c);
    }
}

#[test]
fn joint_distribution_shape() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let x: Vec<i32> = (0..100).map(|i| i % 10).collect();
    let y: Vec<f64> = (0..100).map(|i| (i % 4) as f64).collect();
    write_i32_column(dir.path(), "x", &x);
    write_f64_column(dir.path(), "y", &y);
    write_basic_header(
        dir.path(),
        "joint",
        100,
        &[("x", ColType::Int), ("y", ColType::Double)],
    );
    let part = open_partition(dir.path());
    let hist = HistogramEngine::new(&part);
    let (b1, b2, counts) = hist
        .joint_distribution(None, "x", Some(&[2.0, 5.0]), "y", Some(&[1.0, 2.0, 3.0]))
        .unwrap();
    assert_eq!(b1, vec![2.0, 5.0]);
    assert_eq!(b2, vec![1.0, 2.0, 3.0]);
    assert_eq!(counts.len(), (b1.len() + 1) * (b2.len() + 1));
    assert_eq!(counts.iter().sum::<u64>(), 100);
}
