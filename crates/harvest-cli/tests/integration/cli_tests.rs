use crate::integration::common::{all_items, demo_items, harvest, stderr};

#[test]
fn demo_with_threads_collects_every_item() {
    let output = harvest(&["demo", "--pages", "3", "--items", "4", "--workers", "3"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let items = demo_items(&output.stdout);
    assert_eq!(items, all_items(3, 4));
    assert!(stderr(&output).contains("12 results"));
}

#[test]
fn demo_with_processes_collects_every_item() {
    let output = harvest(&[
        "demo",
        "--pages",
        "2",
        "--items",
        "3",
        "--workers",
        "2",
        "--isolation",
        "process",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let items = demo_items(&output.stdout);
    assert_eq!(items, all_items(2, 3));
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 6);
}

#[test]
fn always_failing_tasks_end_up_dead_lettered() {
    let output = harvest(&[
        "demo",
        "--pages",
        "2",
        "--workers",
        "1",
        "--fault-rate",
        "1.0",
        "--max-attempts",
        "2",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(output.stdout.is_empty());

    let log = stderr(&output);
    assert!(log.contains("0 results"), "stderr: {log}");
    assert!(log.contains("2 dead letters"), "stderr: {log}");
    assert!(log.contains("4 crashes"), "stderr: {log}");
}

#[test]
fn process_workers_recover_from_crashes() {
    let output = harvest(&[
        "demo",
        "--pages",
        "1",
        "--workers",
        "1",
        "--isolation",
        "process",
        "--fault-rate",
        "1.0",
        "--max-attempts",
        "1",
        "--crash-policy",
        "abandon",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let log = stderr(&output);
    assert!(log.contains("1 dead letters"), "stderr: {log}");
    assert!(log.contains("1 crashes"), "stderr: {log}");
}

#[test]
fn csv_output_goes_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.csv");
    let output = harvest(&[
        "demo",
        "--pages",
        "1",
        "--items",
        "2",
        "--format",
        "csv",
        "--output",
        path.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(output.stdout.is_empty());

    let csv = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.remove(0), "index,page");
    lines.sort_unstable();
    assert_eq!(lines, vec!["1,1", "2,1"]);
}

#[test]
fn zero_workers_is_rejected() {
    let output = harvest(&["demo", "--workers", "0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("worker_count"));
}
