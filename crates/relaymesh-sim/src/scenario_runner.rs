/// `relaymesh-sim all`: each scenario at its defaults, one after the other,
/// then a combined table on stderr and a single JSON summary on stdout.
use std::time::Instant;

use serde::Serialize;

use crate::scenario_churn::{self, ChurnConfig};
use crate::scenario_common::ScenarioResult;
use crate::scenario_ledger::{self, LedgerConfig};
use crate::scenario_loop::{self, LoopConfig};
use crate::scenario_multipath::{self, MultipathConfig};

/// One row per scenario; `verdict` is `pass`, `fail`, or `error` when the
/// scenario could not even be set up.
#[derive(Serialize)]
struct SuiteRow {
    scenario: &'static str,
    verdict: &'static str,
    steps_ok: usize,
    steps_failed: usize,
    ms: f64,
}

#[derive(Serialize)]
struct SuiteReport {
    event: &'static str,
    rows: Vec<SuiteRow>,
    steps_ok: usize,
    steps_failed: usize,
    seconds: f64,
    ok: bool,
}

impl SuiteReport {
    fn new() -> Self {
        Self {
            event: "mesh_suite",
            rows: Vec::new(),
            steps_ok: 0,
            steps_failed: 0,
            seconds: 0.0,
            ok: true,
        }
    }

    fn record(&mut self, scenario: &'static str, outcome: anyhow::Result<ScenarioResult>) {
        let row = match outcome {
            Ok(result) => {
                result.print_summary();
                result.emit_jsonl();
                SuiteRow {
                    scenario,
                    verdict: if result.success() { "pass" } else { "fail" },
                    steps_ok: result.passed,
                    steps_failed: result.failed,
                    ms: result.total_ms,
                }
            }
            Err(e) => {
                eprintln!("{scenario}: could not run: {e:#}");
                SuiteRow {
                    scenario,
                    verdict: "error",
                    steps_ok: 0,
                    steps_failed: 1,
                    ms: 0.0,
                }
            }
        };
        self.steps_ok += row.steps_ok;
        self.steps_failed += row.steps_failed;
        self.ok &= row.verdict == "pass";
        self.rows.push(row);
    }

    fn print_table(&self) {
        eprintln!();
        eprintln!("{:<10}  {:>7}  {:>9}  verdict", "scenario", "steps", "ms");
        for row in &self.rows {
            eprintln!(
                "{:<10}  {:>3}/{:<3}  {:>9.1}  {}",
                row.scenario,
                row.steps_ok,
                row.steps_ok + row.steps_failed,
                row.ms,
                row.verdict,
            );
        }
        eprintln!(
            "{} steps ok, {} failed in {:.1}s: {}",
            self.steps_ok,
            self.steps_failed,
            self.seconds,
            if self.ok { "all green" } else { "FAILED" },
        );
    }
}

fn announce(scenario: &str) {
    eprintln!("\n== {scenario} ==");
}

pub async fn run() -> anyhow::Result<()> {
    let started = Instant::now();
    let mut report = SuiteReport::new();

    announce("loop");
    let outcome = scenario_loop::run(LoopConfig {
        nodes: 12,
        chords: 6,
        ttl: 6,
    })
    .await;
    report.record("loop", outcome);

    announce("churn");
    let outcome = scenario_churn::run(ChurnConfig { spokes: 10, spares: 4 }).await;
    report.record("churn", outcome);

    announce("multipath");
    let outcome = scenario_multipath::run(MultipathConfig { paths: 3, sends: 20 }).await;
    report.record("multipath", outcome);

    announce("ledger");
    let outcome = scenario_ledger::run(LedgerConfig { hops: 4, payments: 5 }).await;
    report.record("ledger", outcome);

    report.seconds = started.elapsed().as_secs_f64();
    println!("{}", serde_json::to_string(&report)?);
    report.print_table();

    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
