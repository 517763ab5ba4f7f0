//! Run one session against the simulated timer and print the splits.
//!
//! Usage: cargo run --features cli --bin shotline-sim [SHOTS]
//!
//! Log filter: `RUST_LOG`, then `SHOTLINE_LOG`, default `info`.

use std::env;
use std::process;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shotline::protocol::config::StartMode;
use shotline::sim::{SimDevice, SimOptions};
use shotline::{PollPhase, Poller, PollerConfig, Snapshot, format_seconds};

const DEFAULT_FILTER: &str = "info";
const DEFAULT_SHOTS: u32 = 5;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            env::var("SHOTLINE_LOG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .and_then(|v| EnvFilter::try_new(v).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}

fn shots_arg() -> u32 {
    match env::args().nth(1) {
        None => DEFAULT_SHOTS,
        Some(arg) => match arg.parse() {
            Ok(n) if n > 0 => n,
            _ => {
                eprintln!("usage: shotline-sim [SHOTS]");
                process::exit(2);
            }
        },
    }
}

fn timed_shots(snap: &Snapshot) -> usize {
    snap.real_shots().filter(|s| s.elapsed_ms.is_some()).count()
}

fn print_table(snap: &Snapshot) {
    println!();
    println!("{:>3}  {:>9}  {:>9}", "#", "time", "split");
    for slot in &snap.slots {
        let time = slot.elapsed_ms.map_or("-".into(), |ms| format_seconds(i64::from(ms)));
        let split = slot.split_ms.map_or("-".into(), format_seconds);
        let flag = if slot.false_start { "  false start" } else { "" };
        println!("{:>3}  {time:>9}  {split:>9}{flag}", slot.id);
    }
    if let (Some(first), Some(last)) = (snap.first_ms(), snap.last_ms()) {
        println!();
        println!("first {}  last {}", format_seconds(first.into()), format_seconds(last.into()));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();
    let shots = shots_arg();

    let (device, link) = SimDevice::connect(SimOptions {
        chunk_size: 5,
        reply_delay: Duration::from_millis(15),
        ..SimOptions::default()
    });
    let config = PollerConfig {
        start_mode: StartMode::Randomized {
            min_ms: 1000,
            max_ms: 2500,
        },
        ..PollerConfig::default()
    };
    let poller = Poller::new(link, config);

    let mut events = poller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut snapshots = poller.watch();
    poller.start();
    if snapshots
        .wait_for(|s| s.phase == PollPhase::Polling)
        .await
        .is_err()
    {
        eprintln!("poller went away before the beep");
        process::exit(1);
    }

    for _ in 0..shots {
        let gap = rand::thread_rng().gen_range(250..900);
        tokio::time::sleep(Duration::from_millis(gap)).await;
        let elapsed_ms = device.fire();
        info!(elapsed_ms, "bang");
    }

    let wanted = shots as usize;
    let done = tokio::time::timeout(
        Duration::from_secs(10),
        snapshots.wait_for(|s| timed_shots(s) >= wanted || s.phase == PollPhase::Stopped),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    if !done {
        warn!("not every shot was timed");
    }

    poller.stop();
    print_table(&poller.snapshot());
}
