use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn e2e_enabled() -> bool {
    // needs root or CAP_BPF
    let enabled = std::env::var("PROCEVENTS_EBPF_E2E")
        .map(|v| v == "1")
        .unwrap_or(false);
    if !enabled {
        eprintln!("skipped: set PROCEVENTS_EBPF_E2E=1 to run");
    }
    enabled
}

fn exit_helper_bin() -> PathBuf {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let target = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| base.join("../target"));
    let bin = target.join("debug/exit_helper");
    assert!(
        bin.exists(),
        "{} missing; run `cargo build` for the workspace first",
        bin.display()
    );
    bin
}

struct Agent {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl Agent {
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_procevents"))
            .env(
                "RUST_LOG",
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to spawn procevents");

        let stdout = child.stdout.take().expect("stdout is piped");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        // give the agent time to load and attach
        thread::sleep(Duration::from_secs(2));
        Self { child, lines }
    }

    fn signal(&self, sig: Signal) {
        kill(Pid::from_raw(self.child.id() as i32), sig).expect("failed to signal agent");
    }

    /// Collects parsed events until `done` is satisfied or `limit` passes.
    fn collect_until(
        &self,
        limit: Duration,
        mut done: impl FnMut(&[serde_json::Value]) -> bool,
    ) -> Vec<serde_json::Value> {
        let deadline = Instant::now() + limit;
        let mut events = Vec::new();
        while Instant::now() < deadline && !done(&events) {
            if let Ok(line) = self.lines.recv_timeout(Duration::from_millis(100)) {
                let value: serde_json::Value =
                    serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad line {line:?}: {e}"));
                events.push(value);
            }
        }
        events
    }

    fn wait_exit(mut self, limit: Duration) -> ExitStatus {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait failed") {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("agent did not exit within {limit:?}");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn is_helper(event: &serde_json::Value) -> bool {
    event["Comm"] == "exit_helper"
}

#[test]
#[ignore]
fn streams_exec_and_exit_events_as_json_lines() {
    if !e2e_enabled() {
        return;
    }

    let agent = Agent::spawn();
    let lifetime_ms = 300u64;
    let exit_status = 3;
    let status = Command::new(exit_helper_bin())
        .arg(lifetime_ms.to_string())
        .arg(exit_status.to_string())
        .stdout(Stdio::null())
        .status()
        .expect("failed to run exit_helper");
    assert_eq!(status.code(), Some(exit_status));

    let events = agent.collect_until(Duration::from_secs(5), |events| {
        events.iter().filter(|e| is_helper(e)).count() >= 2
    });
    let helper: Vec<_> = events.iter().filter(|e| is_helper(e)).collect();
    assert_eq!(helper.len(), 2, "expected exec and exit events, got {events:?}");

    for event in &helper {
        let mut keys: Vec<_> = event.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["Comm", "DurationNs", "ExitCode", "FileName", "PPid", "Pid"]);
    }

    let exec = helper[0];
    assert!(exec["FileName"].as_str().unwrap().ends_with("exit_helper"));
    let exit = helper[1];
    assert_eq!(exec["Pid"], exit["Pid"]);
    // the helper was forked by this test process
    let parent = i64::from(std::process::id());
    assert_eq!(exec["PPid"].as_i64(), Some(parent));
    assert_eq!(exit["PPid"].as_i64(), Some(parent));
    assert_eq!(exit["ExitCode"].as_i64(), Some(i64::from(exit_status)));
    let duration_ns = exit["DurationNs"].as_i64().unwrap();
    assert!(
        duration_ns >= (lifetime_ms * 1_000_000) as i64,
        "duration {duration_ns}ns shorter than helper lifetime"
    );

    agent.signal(Signal::SIGINT);
    let status = agent.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(0), "single signal should shut down cleanly");
}

#[test]
#[ignore]
fn second_signal_forces_exit_status_one() {
    if !e2e_enabled() {
        return;
    }

    let agent = Agent::spawn();
    // different signals are never coalesced, so both are delivered
    agent.signal(Signal::SIGTERM);
    agent.signal(Signal::SIGINT);

    let status = agent.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
}
