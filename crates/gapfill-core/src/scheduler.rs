//! Runs each tile as an isolated, deadline-bounded unit of work.
//!
//! Units are launched in tile order with at most `max_parallel` outstanding.
//! A unit that outlives its deadline is killed outright; the scheduler never
//! waits on cooperation from the worker. Every tile ends in exactly one
//! terminal state and nothing a tile does stops the tiles after it.
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Worker exit code for a classified tile.
pub const EXIT_CLASSIFIED: i32 = 0;
/// Worker exit code for a tile skipped for lack of training signal.
pub const EXIT_SKIPPED: i32 = 3;

pub const DEFAULT_TILE_TIMEOUT: Duration = Duration::from_secs(10 * 60 * 60);

// ── Jobs and states ───────────────────────────────────────────────────────────

/// One tile's unit of work. Identity is its position in the partition order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileJob {
    pub raw: PathBuf,
    pub train: PathBuf,
    pub output_dir: PathBuf,
    /// Output file name inside `output_dir`.
    pub output_name: String,
}

impl TileJob {
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_name)
    }

    /// Output name without extension, used for logs.
    pub fn name(&self) -> &str {
        Path::new(&self.output_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.output_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Classified,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TileState {
    Pending,
    Running,
    Completed(Completion),
    Failed(String),
    TimedOut,
}

impl TileState {
    pub fn name(&self) -> &'static str {
        match self {
            TileState::Pending => "pending",
            TileState::Running => "running",
            TileState::Completed(_) => "completed",
            TileState::Failed(_) => "failed",
            TileState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TileState::Completed(_) | TileState::Failed(_) | TileState::TimedOut)
    }

    /// Pending -> Running, or Running -> any terminal state.
    pub fn advance(self, next: TileState) -> Result<TileState> {
        let allowed = match (&self, &next) {
            (TileState::Pending, TileState::Running) => true,
            (TileState::Running, n) => n.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.name(),
                to: next.name(),
            })
        }
    }
}

/// How a finished unit ended: a normal completion or a failure description.
pub type UnitResult = std::result::Result<Completion, String>;

/// Map a worker's exit status onto the worker protocol.
pub fn completion_from_status(status: ExitStatus) -> UnitResult {
    match status.code() {
        Some(EXIT_CLASSIFIED) => Ok(Completion::Classified),
        Some(EXIT_SKIPPED) => Ok(Completion::Skipped),
        Some(code) => Err(format!("worker exited with status {code}")),
        None => Err(format!("worker terminated: {status}")),
    }
}

// ── Units of work ─────────────────────────────────────────────────────────────

/// Starts isolated units of work.
pub trait UnitLauncher {
    type Unit: RunningUnit;

    fn launch(&self, job: &TileJob) -> Result<Self::Unit>;
}

/// A launched unit the scheduler polls and may kill.
pub trait RunningUnit {
    /// `Ok(None)` while the unit is still running.
    fn try_wait(&mut self) -> Result<Option<UnitResult>>;

    /// Unconditional termination. Must not block on the unit's cooperation.
    fn terminate(&mut self) -> Result<()>;
}

/// Launches the tile worker binary, one OS process per tile.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    /// Arguments placed before the tile arguments.
    pub base_args: Vec<String>,
    pub log_dir: PathBuf,
    pub zero_quota: usize,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, log_dir: impl Into<PathBuf>, zero_quota: usize) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            log_dir: log_dir.into(),
            zero_quota,
        }
    }

    fn command(&self, job: &TileJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--raw")
            .arg(&job.raw)
            .arg("--train")
            .arg(&job.train)
            .arg("--out-dir")
            .arg(&job.output_dir)
            .arg("--name")
            .arg(&job.output_name)
            .arg("--log-dir")
            .arg(&self.log_dir)
            .arg("--zero-quota")
            .arg(self.zero_quota.to_string())
            .stdin(Stdio::null());
        cmd
    }
}

impl UnitLauncher for ProcessLauncher {
    type Unit = ProcessUnit;

    fn launch(&self, job: &TileJob) -> Result<ProcessUnit> {
        let child = self.command(job).spawn().map_err(|e| Error::ExternalStep {
            program: self.program.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(ProcessUnit { child })
    }
}

#[derive(Debug)]
pub struct ProcessUnit {
    child: Child,
}

impl ProcessUnit {
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl RunningUnit for ProcessUnit {
    fn try_wait(&mut self) -> Result<Option<UnitResult>> {
        Ok(self.child.try_wait()?.map(completion_from_status))
    }

    fn terminate(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        self.child.wait()?;
        Ok(())
    }
}

/// `classify_tile` next to the running executable.
pub fn default_worker_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("classify_tile{}", std::env::consts::EXE_SUFFIX)))
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileRecord {
    pub index: usize,
    pub name: String,
    pub state: TileState,
    pub elapsed_secs: f64,
}

/// Terminal state of every tile, in launch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub tiles: Vec<TileRecord>,
}

impl ScheduleReport {
    fn count(&self, pred: impl Fn(&TileState) -> bool) -> usize {
        self.tiles.iter().filter(|t| pred(&t.state)).count()
    }

    pub fn classified(&self) -> usize {
        self.count(|s| *s == TileState::Completed(Completion::Classified))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| *s == TileState::Completed(Completion::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TileState::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|s| *s == TileState::TimedOut)
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TileScheduler {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_parallel: usize,
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TILE_TIMEOUT,
            poll_interval: Duration::from_millis(500),
            max_parallel: 1,
        }
    }
}

struct Slot<U> {
    index: usize,
    unit: U,
    started: Instant,
    deadline: Instant,
}

impl TileScheduler {
    /// Run every job to a terminal state. Never fails as a whole: launch and
    /// wait errors are recorded against the tile they belong to.
    pub fn run<L: UnitLauncher>(&self, launcher: &L, jobs: &[TileJob]) -> ScheduleReport {
        let max_parallel = self.max_parallel.max(1);
        let mut finished: Vec<Option<TileRecord>> = vec![None; jobs.len()];
        let mut running: Vec<Slot<L::Unit>> = Vec::with_capacity(max_parallel);
        let mut next = 0;

        loop {
            while running.len() < max_parallel && next < jobs.len() {
                let job = &jobs[next];
                info!(tile = job.name(), index = next, "launching tile");
                match launcher.launch(job) {
                    Ok(unit) => {
                        let started = Instant::now();
                        running.push(Slot {
                            index: next,
                            unit,
                            started,
                            deadline: started + self.timeout,
                        });
                    }
                    Err(e) => {
                        error!(tile = job.name(), error = %e, "could not launch tile, continuing");
                        let state = settle(TileState::Pending, [TileState::Running, TileState::Failed(e.to_string())]);
                        finished[next] = Some(record(next, job, state, Duration::ZERO));
                    }
                }
                next += 1;
            }

            if running.is_empty() {
                break;
            }

            running.retain_mut(|slot| {
                let job = &jobs[slot.index];
                match self.poll(slot, job) {
                    Some(state) => {
                        finished[slot.index] = Some(record(slot.index, job, state, slot.started.elapsed()));
                        false
                    }
                    None => true,
                }
            });

            if !running.is_empty() {
                thread::sleep(self.poll_interval);
            }
        }

        ScheduleReport {
            tiles: finished.into_iter().flatten().collect(),
        }
    }

    /// Terminal state of `slot` if it has reached one.
    fn poll<U: RunningUnit>(&self, slot: &mut Slot<U>, job: &TileJob) -> Option<TileState> {
        let next = match slot.unit.try_wait() {
            Ok(Some(Ok(completion))) => {
                info!(tile = job.name(), outcome = ?completion, elapsed = ?slot.started.elapsed(), "tile completed");
                TileState::Completed(completion)
            }
            Ok(Some(Err(reason))) => {
                warn!(tile = job.name(), %reason, "tile failed, continuing with next tile");
                TileState::Failed(reason)
            }
            Ok(None) if Instant::now() >= slot.deadline => {
                warn!(tile = job.name(), timeout = ?self.timeout, "tile timed out, terminating");
                if let Err(e) = slot.unit.terminate() {
                    error!(tile = job.name(), error = %e, "could not terminate tile");
                }
                TileState::TimedOut
            }
            Ok(None) => return None,
            Err(e) => {
                error!(tile = job.name(), error = %e, "lost track of tile, terminating");
                if let Err(kill) = slot.unit.terminate() {
                    error!(tile = job.name(), error = %kill, "could not terminate tile");
                }
                TileState::Failed(e.to_string())
            }
        };
        Some(settle(TileState::Running, [next]))
    }
}

/// Walk `from` through `steps`; an illegal step is recorded as a failure.
fn settle(from: TileState, steps: impl IntoIterator<Item = TileState>) -> TileState {
    steps
        .into_iter()
        .try_fold(from, TileState::advance)
        .unwrap_or_else(|e| TileState::Failed(e.to_string()))
}

fn record(index: usize, job: &TileJob, state: TileState, elapsed: Duration) -> TileRecord {
    TileRecord {
        index,
        name: job.name().to_string(),
        state,
        elapsed_secs: elapsed.as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Debug, Clone)]
    enum Behavior {
        /// Finishes after the given number of polls.
        Finish(usize, UnitResult),
        Hang,
        LaunchError,
        /// Status queries and termination both fail.
        Unreachable,
    }

    #[derive(Default)]
    struct Probe {
        launched: RefCell<Vec<String>>,
        terminated: RefCell<Vec<String>>,
        active: Cell<usize>,
        max_active: Cell<usize>,
    }

    struct FakeLauncher {
        behaviors: HashMap<String, Behavior>,
        probe: Rc<Probe>,
    }

    struct FakeUnit {
        name: String,
        behavior: Behavior,
        polls: usize,
        probe: Rc<Probe>,
        done: bool,
    }

    impl FakeUnit {
        fn finish(&mut self) {
            if !self.done {
                self.done = true;
                self.probe.active.set(self.probe.active.get() - 1);
            }
        }
    }

    impl UnitLauncher for FakeLauncher {
        type Unit = FakeUnit;

        fn launch(&self, job: &TileJob) -> Result<FakeUnit> {
            let behavior = self.behaviors[job.name()].clone();
            if let Behavior::LaunchError = behavior {
                return Err(Error::ExternalStep {
                    program: "classify_tile".into(),
                    reason: "not found".into(),
                });
            }
            self.probe.launched.borrow_mut().push(job.name().to_string());
            let active = self.probe.active.get() + 1;
            self.probe.active.set(active);
            self.probe.max_active.set(self.probe.max_active.get().max(active));
            Ok(FakeUnit {
                name: job.name().to_string(),
                behavior,
                polls: 0,
                probe: Rc::clone(&self.probe),
                done: false,
            })
        }
    }

    impl RunningUnit for FakeUnit {
        fn try_wait(&mut self) -> Result<Option<UnitResult>> {
            self.polls += 1;
            match &self.behavior {
                Behavior::Unreachable => Err(Error::Io(std::io::Error::other("wait failed"))),
                Behavior::Finish(after, result) if self.polls >= *after => {
                    let result = result.clone();
                    self.finish();
                    Ok(Some(result))
                }
                _ => Ok(None),
            }
        }

        fn terminate(&mut self) -> Result<()> {
            self.probe.terminated.borrow_mut().push(self.name.clone());
            if let Behavior::Unreachable = self.behavior {
                return Err(Error::Io(std::io::Error::other("kill failed")));
            }
            self.finish();
            Ok(())
        }
    }

    fn jobs(names: &[&str]) -> Vec<TileJob> {
        names
            .iter()
            .map(|n| TileJob {
                raw: PathBuf::from(format!("{n}_raw.tif")),
                train: PathBuf::from(format!("{n}_tr.tif")),
                output_dir: PathBuf::from("subsetResults"),
                output_name: format!("{n}.tif"),
            })
            .collect()
    }

    fn launcher(behaviors: &[(&str, Behavior)]) -> FakeLauncher {
        FakeLauncher {
            behaviors: behaviors.iter().map(|(n, b)| (n.to_string(), b.clone())).collect(),
            probe: Rc::new(Probe::default()),
        }
    }

    fn fast(max_parallel: usize) -> TileScheduler {
        TileScheduler {
            timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
            max_parallel,
        }
    }

    fn states(report: &ScheduleReport) -> Vec<TileState> {
        report.tiles.iter().map(|t| t.state.clone()).collect()
    }

    #[test]
    fn every_tile_reaches_a_terminal_state_in_launch_order() {
        let launcher = launcher(&[
            ("t0", Behavior::Finish(1, Ok(Completion::Classified))),
            ("t1", Behavior::Finish(2, Ok(Completion::Skipped))),
            ("t2", Behavior::Finish(1, Err("model error".into()))),
            ("t3", Behavior::Hang),
            ("t4", Behavior::Finish(3, Ok(Completion::Classified))),
        ]);
        let report = fast(1).run(&launcher, &jobs(&["t0", "t1", "t2", "t3", "t4"]));

        assert_eq!(
            states(&report),
            vec![
                TileState::Completed(Completion::Classified),
                TileState::Completed(Completion::Skipped),
                TileState::Failed("model error".into()),
                TileState::TimedOut,
                TileState::Completed(Completion::Classified),
            ]
        );
        assert_eq!(report.tiles.iter().map(|t| t.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*launcher.probe.terminated.borrow(), vec!["t3".to_string()]);
        assert_eq!((report.classified(), report.skipped(), report.failed(), report.timed_out()), (2, 1, 1, 1));
    }

    #[test]
    fn timed_out_tile_is_killed_within_a_poll_of_its_deadline() {
        let launcher = launcher(&[("slow", Behavior::Hang)]);
        let started = Instant::now();
        let report = fast(1).run(&launcher, &jobs(&["slow"]));

        assert_eq!(states(&report), vec![TileState::TimedOut]);
        assert!(report.tiles[0].elapsed_secs >= 0.06);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn launch_failure_marks_tile_failed_and_continues() {
        let launcher = launcher(&[
            ("a", Behavior::LaunchError),
            ("b", Behavior::Finish(1, Ok(Completion::Classified))),
        ]);
        let report = fast(1).run(&launcher, &jobs(&["a", "b"]));

        assert!(matches!(&report.tiles[0].state, TileState::Failed(reason) if reason.contains("not found")));
        assert_eq!(report.tiles[1].state, TileState::Completed(Completion::Classified));
        assert_eq!(*launcher.probe.launched.borrow(), vec!["b".to_string()]);
    }

    #[test]
    fn unreachable_tile_fails_even_when_it_cannot_be_killed() {
        let launcher = launcher(&[
            ("lost", Behavior::Unreachable),
            ("next", Behavior::Finish(1, Ok(Completion::Classified))),
        ]);
        let report = fast(2).run(&launcher, &jobs(&["lost", "next"]));

        assert!(matches!(&report.tiles[0].state, TileState::Failed(reason) if reason.contains("wait failed")));
        assert_eq!(report.tiles[1].state, TileState::Completed(Completion::Classified));
        assert_eq!(*launcher.probe.terminated.borrow(), vec!["lost".to_string()]);
    }

    #[test]
    fn sequential_by_default() {
        let launcher = launcher(&[
            ("a", Behavior::Finish(3, Ok(Completion::Classified))),
            ("b", Behavior::Finish(3, Ok(Completion::Classified))),
        ]);
        fast(1).run(&launcher, &jobs(&["a", "b"]));
        assert_eq!(launcher.probe.max_active.get(), 1);
    }

    #[test]
    fn bounded_parallelism_keeps_order_and_deadlines() {
        let launcher = launcher(&[
            ("a", Behavior::Finish(4, Ok(Completion::Classified))),
            ("b", Behavior::Hang),
            ("c", Behavior::Finish(1, Ok(Completion::Skipped))),
            ("d", Behavior::Finish(2, Err("crashed".into()))),
        ]);
        let report = fast(2).run(&launcher, &jobs(&["a", "b", "c", "d"]));

        assert_eq!(launcher.probe.max_active.get(), 2);
        assert_eq!(
            states(&report),
            vec![
                TileState::Completed(Completion::Classified),
                TileState::TimedOut,
                TileState::Completed(Completion::Skipped),
                TileState::Failed("crashed".into()),
            ]
        );
    }

    #[test]
    fn empty_job_list_is_an_empty_report() {
        let launcher = launcher(&[]);
        assert!(fast(1).run(&launcher, &[]).tiles.is_empty());
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        let running = TileState::Pending.advance(TileState::Running).unwrap();
        assert!(!running.is_terminal());
        let done = running.advance(TileState::TimedOut).unwrap();
        assert!(done.is_terminal());

        assert!(matches!(
            done.advance(TileState::Running),
            Err(Error::InvalidTransition { from: "timed_out", to: "running" })
        ));
        assert!(TileState::Pending.advance(TileState::TimedOut).is_err());
        assert!(TileState::Running.advance(TileState::Pending).is_err());
        assert!(TileState::Completed(Completion::Skipped).advance(TileState::Failed("x".into())).is_err());
    }

    #[test]
    fn settle_records_illegal_paths_as_failures() {
        assert_eq!(
            settle(TileState::Pending, [TileState::Running, TileState::Failed("spawn".into())]),
            TileState::Failed("spawn".into())
        );
        assert!(matches!(
            settle(TileState::Pending, [TileState::TimedOut]),
            TileState::Failed(reason) if reason.contains("pending -> timed_out")
        ));
    }

    #[test]
    fn job_name_drops_extension() {
        let job = &jobs(&["brick_2.3_sub"])[0];
        assert_eq!(job.name(), "brick_2.3_sub");
        assert_eq!(job.output_path(), PathBuf::from("subsetResults/brick_2.3_sub.tif"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn shell(script: &str) -> ProcessLauncher {
            let mut launcher = ProcessLauncher::new("sh", "logs", 1000);
            // `sh -c SCRIPT NAME ARGS...`: the tile arguments land in $1.. and are ignored.
            launcher.base_args = vec!["-c".into(), script.into(), "classify_tile".into()];
            launcher
        }

        #[test]
        fn exit_codes_follow_worker_protocol() {
            let scheduler = fast(1);
            let cases = [
                ("exit 0", TileState::Completed(Completion::Classified)),
                ("exit 3", TileState::Completed(Completion::Skipped)),
                ("exit 1", TileState::Failed("worker exited with status 1".into())),
            ];
            for (script, expected) in cases {
                let scheduler = TileScheduler { timeout: Duration::from_secs(20), ..scheduler.clone() };
                let report = scheduler.run(&shell(script), &jobs(&["t"]));
                assert_eq!(report.tiles[0].state, expected, "script `{script}`");
            }
        }

        #[test]
        fn runaway_worker_is_killed() {
            let scheduler = TileScheduler {
                timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
                max_parallel: 1,
            };
            let started = Instant::now();
            let report = scheduler.run(&shell("exec sleep 30"), &jobs(&["t"]));
            assert_eq!(report.tiles[0].state, TileState::TimedOut);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn missing_worker_binary_fails_the_tile() {
            let launcher = ProcessLauncher::new("/nonexistent/classify_tile", "logs", 1000);
            let report = fast(1).run(&launcher, &jobs(&["t"]));
            assert!(matches!(report.tiles[0].state, TileState::Failed(_)));
        }
    }
}
