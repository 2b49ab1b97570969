//! Trellis DAG simulator
//!
//! Feeds a randomly generated DAG into a consensus engine and reports how the
//! main chain and the stability point advance. Some units are delivered after
//! their children and some authors double-spend, which exercises dependency
//! tracking and conflict resolution.
//!
//! Usage: cargo run --bin simulator -- --units 500 --seed 7

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

use trellis::config::TrellisConfig;
use trellis::consensus::audit;
use trellis::consensus::{Address, OutputRef, Unit, UnitBuilder, UnitId};
use trellis::constants::{COUNT_WITNESSES, MAX_PARENTS_PER_UNIT};
use trellis::node::{ConsensusEvent, Engine, HandleOutcome, SledStorage};
use trellis::validation::{BasicValidator, TrustAuthors};

#[derive(Parser, Debug)]
#[command(name = "simulator", about = "Random DAG simulator for the trellis consensus engine")]
struct Cli {
    /// Number of units to generate
    #[arg(long, default_value_t = 300)]
    units: usize,
    /// Number of non-witness authors
    #[arg(long, default_value_t = 4)]
    users: u8,
    /// Maximum parents per unit
    #[arg(long, default_value_t = 3)]
    max_parents: usize,
    /// Share of units authored by witnesses
    #[arg(long, default_value_t = 0.7)]
    witness_share: f64,
    /// Chance a user unit gets a conflicting twin
    #[arg(long, default_value_t = 0.05)]
    double_spend_rate: f64,
    /// Chance a unit is delivered after a child of it
    #[arg(long, default_value_t = 0.05)]
    reorder_rate: f64,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Persist to this directory instead of a temporary database
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

type SimEngine = Engine<SledStorage, BasicValidator<TrustAuthors>>;

/// Result of a single check.
struct CheckResult {
    name: String,
    passed: bool,
    detail: String,
}

impl CheckResult {
    fn pass(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.to_string(),
        }
    }
    fn fail(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.to_string(),
        }
    }
}

#[derive(Default)]
struct Stats {
    accepted: usize,
    pending: usize,
    rejected: usize,
    double_spends: usize,
    reordered: usize,
    stable_events: u64,
    rejected_events: usize,
}

fn witness(i: usize) -> Address {
    let mut a = [0u8; 32];
    a[0] = 0xee;
    a[1] = i as u8;
    Address(a)
}

fn user(n: u8) -> Address {
    Address([n; 32])
}

fn fail_fast(what: &str, error: impl std::fmt::Display) -> ! {
    println!("  {} {}: {}", "FAIL".red().bold(), what, error);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!(
        "\n{}",
        "========================================".bright_cyan()
    );
    println!("{}", "       TRELLIS DAG SIMULATOR".bright_cyan().bold());
    println!(
        "{}\n",
        "========================================".bright_cyan()
    );

    let (config, storage) = match &cli.data_dir {
        Some(dir) => (TrellisConfig::load(dir), SledStorage::open(dir)),
        None => (TrellisConfig::default(), SledStorage::open_temporary()),
    };
    let storage = storage.unwrap_or_else(|e| fail_fast("open storage", e));
    let engine_config = config
        .engine_config()
        .unwrap_or_else(|e| fail_fast("load config", e));
    let validator = BasicValidator::new(TrustAuthors, config.consensus.upgrades);
    let witnesses: Vec<Address> = (0..COUNT_WITNESSES).map(witness).collect();
    let engine = Engine::open(storage, validator, Unit::genesis(&witnesses), engine_config)
        .unwrap_or_else(|e| fail_fast("open engine", e));
    let mut events = engine.subscribe();
    let start_mci = engine.last_stable_mci().await;

    println!(
        "{}",
        format!(
            "[Run] {} units, {} users, seed {}",
            cli.units, cli.users, cli.seed
        )
        .yellow()
    );

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut stats = Stats::default();
    let mut next_witness = 0usize;
    let mut nonce = cli.seed << 32;
    let max_parents = cli.max_parents.clamp(1, MAX_PARENTS_PER_UNIT);
    let users = cli.users.max(1);

    for i in 0..cli.units {
        let by_witness = rng.random_bool(cli.witness_share.clamp(0.0, 1.0));
        let author = if by_witness {
            let w = witness(next_witness);
            next_witness = (next_witness + 1) % COUNT_WITNESSES;
            w
        } else {
            user(rng.random_range(1..=users))
        };
        let parents = pick_parents(&engine, &mut rng, max_parents).await;
        nonce += 1;

        if !by_witness && rng.random_bool(cli.double_spend_rate.clamp(0.0, 1.0)) {
            let output = OutputRef {
                unit: parents[0],
                message_index: 0,
                output_index: 0,
            };
            let first = compose(&engine, &parents, author, nonce, Some(output)).await;
            nonce += 1;
            let twin = compose(&engine, &parents, author, nonce, Some(output)).await;
            submit(&engine, first, &mut stats).await;
            submit(&engine, twin, &mut stats).await;
            stats.double_spends += 1;
        } else if rng.random_bool(cli.reorder_rate.clamp(0.0, 1.0)) {
            let unit = compose(&engine, &parents, author, nonce, None).await;
            nonce += 1;
            let child = child_of(&unit, &engine, user(rng.random_range(1..=users)), nonce).await;
            submit(&engine, child, &mut stats).await;
            submit(&engine, unit, &mut stats).await;
            stats.reordered += 1;
        } else {
            let unit = compose(&engine, &parents, author, nonce, None).await;
            submit(&engine, unit, &mut stats).await;
        }

        drain_events(&mut events, &mut stats);

        if (i + 1) % 50 == 0 {
            println!(
                "  {:>5} units  stable mci {:>4}  free {:>2}  waiting {}",
                i + 1,
                engine.last_stable_mci().await,
                engine.free_units().await.len(),
                engine.unhandled_count().await
            );
        }
    }

    drain_events(&mut events, &mut stats);
    let (stable_events, rejected_events) = (stats.stable_events, stats.rejected_events);

    println!(
        "\n  accepted {}  pending {}  rejected {}  double spends {}  reordered {}",
        stats.accepted, stats.pending, stats.rejected, stats.double_spends, stats.reordered
    );

    let mut results = Vec::new();
    match engine.with_state(audit::audit).await {
        Ok(report) => {
            results.push(CheckResult::pass(
                "State Audit",
                &format!(
                    "{} units, mci 0..={}, {} balls verified",
                    report.units, report.max_mci, report.verified_balls
                ),
            ));
            results.push(CheckResult::pass(
                "Sequences",
                &format!(
                    "{} good, {} temp-bad, {} final-bad",
                    report.good, report.temp_bad, report.final_bad
                ),
            ));
        }
        Err(e) => results.push(CheckResult::fail("State Audit", &e)),
    }

    let last_stable = engine.last_stable_mci().await;
    if last_stable > start_mci {
        results.push(CheckResult::pass(
            "Stability Progress",
            &format!("last stable mci {start_mci} -> {last_stable}"),
        ));
    } else {
        results.push(CheckResult::fail(
            "Stability Progress",
            &format!("stuck at mci {last_stable}"),
        ));
    }

    if stable_events == last_stable - start_mci {
        results.push(CheckResult::pass(
            "Stability Events",
            &format!("{stable_events} mci events, {rejected_events} rejections"),
        ));
    } else {
        results.push(CheckResult::fail(
            "Stability Events",
            &format!(
                "{stable_events} events for {} newly stable mcis",
                last_stable - start_mci
            ),
        ));
    }

    let waiting = engine.unhandled_count().await;
    if waiting == 0 {
        results.push(CheckResult::pass("Dependencies", "no unit left waiting"));
    } else {
        results.push(CheckResult::fail(
            "Dependencies",
            &format!("{waiting} units still waiting"),
        ));
    }

    print_summary(&results);
    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }
}

/// The best free unit plus a random selection of other free units.
async fn pick_parents(engine: &SimEngine, rng: &mut StdRng, max_parents: usize) -> Vec<UnitId> {
    let free = engine.free_units().await;
    let Some((&best, rest)) = free.split_first() else {
        return vec![engine.genesis_id().await];
    };
    let mut others = rest.to_vec();
    others.shuffle(rng);
    let extra = rng.random_range(0..max_parents);
    let mut parents = vec![best];
    parents.extend(others.into_iter().take(extra));
    parents
}

async fn compose(
    engine: &SimEngine,
    parents: &[UnitId],
    author: Address,
    nonce: u64,
    input: Option<OutputRef>,
) -> Unit {
    let genesis = engine.genesis_id().await;
    let (ball, lbu) = engine
        .last_ball_for(parents)
        .await
        .unwrap_or_else(|| fail_fast("compose", "parents unknown"));
    let mut builder = UnitBuilder::new()
        .parents(parents.iter().copied())
        .last_ball(ball, lbu)
        .witness_list_unit(genesis)
        .author(author)
        .timestamp(nonce);
    if let Some(input) = input {
        builder = builder.spend(input);
    }
    builder.build()
}

/// A unit on `parent` composed before `parent` is known locally.
async fn child_of(parent: &Unit, engine: &SimEngine, author: Address, nonce: u64) -> Unit {
    let genesis = engine.genesis_id().await;
    let mut builder = UnitBuilder::new()
        .parents([parent.id])
        .witness_list_unit(genesis)
        .author(author)
        .timestamp(nonce);
    if let (Some(ball), Some(lbu)) = (parent.last_ball, parent.last_ball_unit) {
        builder = builder.last_ball(ball, lbu);
    }
    builder.build()
}

fn drain_events(events: &mut broadcast::Receiver<ConsensusEvent>, stats: &mut Stats) {
    while let Ok(event) = events.try_recv() {
        match event {
            ConsensusEvent::MciBecameStable { .. } => stats.stable_events += 1,
            ConsensusEvent::UnitRejected { .. } => stats.rejected_events += 1,
        }
    }
}

async fn submit(engine: &SimEngine, unit: Unit, stats: &mut Stats) {
    match engine.handle_unit(unit).await {
        Ok(HandleOutcome::Accepted) => stats.accepted += 1,
        Ok(HandleOutcome::Pending(_)) => stats.pending += 1,
        Ok(HandleOutcome::Rejected(reason)) => {
            stats.rejected += 1;
            println!("  {} {}", "REJECTED".red().bold(), reason);
        }
        Ok(_) => {}
        Err(e) => fail_fast("consensus", e),
    }
}

// ── Summary ──

fn print_summary(results: &[CheckResult]) {
    println!(
        "\n{}",
        "========================================".bright_cyan()
    );
    println!("{}", "          SIMULATION RESULTS".bright_cyan().bold());
    println!(
        "{}\n",
        "========================================".bright_cyan()
    );

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;

    for r in results {
        let icon = if r.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        let detail = if r.passed {
            r.detail.dimmed().to_string()
        } else {
            r.detail.red().to_string()
        };
        println!("  [{}] {} - {}", icon, r.name, detail);
    }

    println!();
    if failed == 0 {
        println!(
            "  {} {}/{} checks passed",
            "ALL PASSED".green().bold(),
            passed,
            results.len()
        );
    } else {
        println!(
            "  {} {}/{} passed, {} failed",
            "SOME FAILED".red().bold(),
            passed,
            results.len(),
            failed
        );
    }
    println!();
}
