use std::collections::BTreeSet;
use std::process::{Command, Output};

/// Run the harvest binary with fast supervisor timings.
pub fn harvest(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_harvest"))
        .args(args)
        .args(["--poll-interval-ms", "100", "--pop-timeout-ms", "50"])
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run harvest")
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// `(page, index)` of every demo item on stdout.
pub fn demo_items(stdout: &[u8]) -> BTreeSet<(u64, u64)> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("stdout line is JSON");
            (
                value["page"].as_u64().expect("page"),
                value["index"].as_u64().expect("index"),
            )
        })
        .collect()
}

pub fn all_items(pages: u64, items: u64) -> BTreeSet<(u64, u64)> {
    (1..=pages)
        .flat_map(|page| (1..=items).map(move |index| (page, index)))
        .collect()
}
