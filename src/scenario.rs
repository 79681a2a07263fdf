//! One scenario run: spawn the watched tool on a fixture, wait for its first
//! check, time a series of perturbation rounds, tear it down, summarize.
//!
//! ```text
//! Selecting → Spawned → AwaitingInitial → Idle ⇄ Perturbing → … → Terminating → Reported
//! ```
//!
//! Failures never escape this module: every run produces a `ScenarioOutcome`
//! carrying statistics (zeroed when nothing was measured) and the error, if any.

use crate::config::{BenchConfig, BenchSettings, FixtureConfig, MarkerConfig, ToolConfig};
use crate::detector::MarkerSet;
use crate::lock::{FixtureLock, LockError};
use crate::perturb::{self, ChangeMode, PerturbError, SelectOptions, Snapshot};
use crate::session::{LaunchSpec, SessionError, WatchSession};
use crate::stats::{CycleSample, RunStatistics, RunStatus};
use rand::Rng;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// One tool × fixture combination.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub label: String,
    pub tool: String,
    pub fixture: FixtureConfig,
    pub launch: LaunchSpec,
}

impl ScenarioSpec {
    pub fn new(tool: &ToolConfig, fixture: &FixtureConfig) -> Self {
        let label = format!("{}/{}", tool.name, fixture.name);
        let launch = LaunchSpec {
            label: label.clone(),
            command: tool.command.clone(),
            args: build_args(tool, fixture),
            cwd: fixture.root.clone(),
            env: tool.env.clone(),
        };
        Self {
            label,
            tool: tool.name.clone(),
            fixture: fixture.clone(),
            launch,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.fixture.root
    }
}

/// Replace `{root}` placeholders in tool args with the fixture root.
fn build_args(tool: &ToolConfig, fixture: &FixtureConfig) -> Vec<String> {
    let root = fixture.root.to_string_lossy();
    tool.args
        .iter()
        .map(|arg| arg.replace("{root}", &root))
        .collect()
}

/// Every tool × fixture pair in config order, optionally filtered by label substring.
pub fn expand_matrix(config: &BenchConfig, only: &[String]) -> Vec<ScenarioSpec> {
    config
        .tools
        .iter()
        .flat_map(|tool| config.fixtures.iter().map(move |f| ScenarioSpec::new(tool, f)))
        .filter(|s| only.is_empty() || only.iter().any(|o| s.label.contains(o.as_str())))
        .collect()
}

/// Where a scenario run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Selecting,
    Spawned,
    AwaitingInitial,
    Idle,
    Perturbing,
    Terminating,
    Reported,
}

impl std::fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScenarioState::Selecting => "selecting",
            ScenarioState::Spawned => "spawned",
            ScenarioState::AwaitingInitial => "awaiting_initial",
            ScenarioState::Idle => "idle",
            ScenarioState::Perturbing => "perturbing",
            ScenarioState::Terminating => "terminating",
            ScenarioState::Reported => "reported",
        };
        write!(f, "{name}")
    }
}

/// Errors that end a scenario run.
#[derive(Debug)]
pub enum ScenarioError {
    /// No file under the fixture root matched the selection rules.
    EmptyFixture { root: PathBuf, extension: String },
    /// The fixture is locked by another run, or the lock could not be taken.
    FixtureLocked(LockError),
    /// The watch process could not be started.
    Spawn(SessionError),
    /// A wait exceeded its bound.
    Timeout(SessionError),
    /// The watch process exited while being waited on.
    Exited(SessionError),
    /// A sample file could not be rewritten.
    Perturb(PerturbError),
}

impl ScenarioError {
    pub fn is_empty_fixture(&self) -> bool {
        matches!(self, ScenarioError::EmptyFixture { .. })
    }
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::EmptyFixture { root, extension } => {
                write!(f, "no .{} files found under {}", extension, root.display())
            }
            ScenarioError::FixtureLocked(e) => write!(f, "{e}"),
            ScenarioError::Spawn(e) | ScenarioError::Timeout(e) | ScenarioError::Exited(e) => {
                write!(f, "{e}")
            }
            ScenarioError::Perturb(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::EmptyFixture { .. } => None,
            ScenarioError::FixtureLocked(e) => Some(e),
            ScenarioError::Spawn(e) | ScenarioError::Timeout(e) | ScenarioError::Exited(e) => {
                Some(e)
            }
            ScenarioError::Perturb(e) => Some(e),
        }
    }
}

impl From<SessionError> for ScenarioError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout { .. } => ScenarioError::Timeout(e),
            SessionError::Exited { .. } => ScenarioError::Exited(e),
            _ => ScenarioError::Spawn(e),
        }
    }
}

impl From<PerturbError> for ScenarioError {
    fn from(e: PerturbError) -> Self {
        ScenarioError::Perturb(e)
    }
}

impl From<LockError> for ScenarioError {
    fn from(e: LockError) -> Self {
        ScenarioError::FixtureLocked(e)
    }
}

/// Result of one scenario run. Always carries statistics.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub label: String,
    pub stats: RunStatistics,
    pub error: Option<ScenarioError>,
}

/// What the measurement loop got through before it stopped.
#[derive(Debug, Default)]
struct Progress {
    initial: Option<Duration>,
    samples: Vec<CycleSample>,
}

struct Tracker<'a> {
    label: &'a str,
    state: ScenarioState,
}

impl Tracker<'_> {
    fn enter(&mut self, next: ScenarioState) {
        tracing::debug!(scenario = %self.label, from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

/// Run one scenario end to end.
pub async fn run_scenario<R: Rng + ?Sized>(
    spec: &ScenarioSpec,
    settings: &BenchSettings,
    markers: &MarkerConfig,
    rng: &mut R,
) -> ScenarioOutcome {
    let mut tracker = Tracker {
        label: &spec.label,
        state: ScenarioState::Selecting,
    };

    let result = run_inner(spec, settings, markers, rng, &mut tracker).await;
    tracker.enter(ScenarioState::Reported);

    let (stats, error) = match result {
        Ok(stats) => (stats, None),
        Err((stats, e)) => {
            tracing::warn!(scenario = %spec.label, error = %e, status = %stats.status, "scenario failed");
            (stats, Some(e))
        }
    };
    if error.is_none() {
        tracing::info!(
            scenario = %spec.label,
            initial_ms = stats.initial_ms as u64,
            median_ms = stats.median_ms as u64,
            rounds = stats.samples.len(),
            "scenario completed"
        );
    }

    ScenarioOutcome {
        label: spec.label.clone(),
        stats,
        error,
    }
}

async fn run_inner<R: Rng + ?Sized>(
    spec: &ScenarioSpec,
    settings: &BenchSettings,
    markers: &MarkerConfig,
    rng: &mut R,
    tracker: &mut Tracker<'_>,
) -> Result<RunStatistics, (RunStatistics, ScenarioError)> {
    let failed = |e: ScenarioError| (RunStatistics::failed(), e);

    let options = SelectOptions::new(
        &spec.fixture.extension,
        &spec.fixture.exclude_dirs,
        &spec.fixture.exclude,
    );
    let files = perturb::select_sample_files(spec.root(), &options, settings.sample_files, rng);
    if files.is_empty() {
        return Err(failed(ScenarioError::EmptyFixture {
            root: spec.root().clone(),
            extension: options.extension,
        }));
    }

    let _lock = FixtureLock::acquire(spec.root()).map_err(|e| failed(e.into()))?;
    let snapshot = Snapshot::take(&files)
        .await
        .map_err(|e| failed(e.into()))?;

    let marker_set = MarkerSet::new(markers.start.clone(), markers.end.clone());
    let mut session = WatchSession::spawn(&spec.launch, marker_set, settings.poll_interval())
        .map_err(|e| failed(e.into()))?;
    tracker.enter(ScenarioState::Spawned);

    let mut progress = Progress::default();
    let outcome = measure(&mut session, &files, settings, &mut progress, tracker).await;
    let total = session.elapsed();
    let diagnostics = markers
        .diagnostics
        .as_deref()
        .and_then(|p| Regex::new(p).ok())
        .and_then(|re| session.detector().last_diagnostic_count(&re));
    if outcome.is_err() {
        let stderr = session.stderr_tail(5);
        if !stderr.is_empty() {
            tracing::warn!(scenario = %spec.label, %stderr, "watch process stderr");
        }
    }

    tracker.enter(ScenarioState::Terminating);
    session.terminate(settings.terminate_grace()).await;

    match snapshot.restore().await {
        Ok(0) => {}
        Ok(restored) => {
            tracing::debug!(scenario = %spec.label, restored, "sample files restored");
        }
        Err(e) => {
            tracing::warn!(scenario = %spec.label, error = %e, "failed to restore sample files");
        }
    }

    match outcome {
        Ok(initial) => Ok(RunStatistics::from_samples(
            RunStatus::Completed,
            total,
            initial,
            progress.samples,
            diagnostics,
        )),
        Err(e) => match progress.initial {
            Some(initial) => Err((
                RunStatistics::from_samples(
                    RunStatus::Partial,
                    total,
                    initial,
                    progress.samples,
                    diagnostics,
                ),
                e,
            )),
            None => Err(failed(e)),
        },
    }
}

/// The timed part: initial check, then `rounds` perturb-and-wait cycles.
async fn measure(
    session: &mut WatchSession,
    files: &[PathBuf],
    settings: &BenchSettings,
    progress: &mut Progress,
    tracker: &mut Tracker<'_>,
) -> Result<Duration, ScenarioError> {
    tracker.enter(ScenarioState::AwaitingInitial);
    let initial = session.wait_for_initial(settings.initial_timeout()).await?;
    progress.initial = Some(initial);
    tracing::info!(
        scenario = %session.label(),
        initial_ms = initial.as_millis() as u64,
        files = files.len(),
        "initial check completed"
    );

    for round in 0..settings.rounds {
        tracker.enter(ScenarioState::Idle);
        session.wait_for_idle(settings.idle_timeout()).await?;

        tracker.enter(ScenarioState::Perturbing);
        let mode = ChangeMode::for_round(round);
        let mark = session.completion_mark();
        // The write counts toward the measured interval, so both run together.
        let (waited, applied) = tokio::join!(
            session.wait_for_completion_after(mark, settings.completion_timeout()),
            perturb::apply_change(files, mode),
        );
        applied?;
        let elapsed = waited?;

        tracing::debug!(
            scenario = %session.label(),
            round,
            %mode,
            elapsed_ms = elapsed.as_millis() as u64,
            "round completed"
        );
        progress.samples.push(CycleSample::new(round, elapsed));
    }
    Ok(initial)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use std::path::Path;

    pub const START: &str = "File change detected. Starting incremental compilation...";
    pub const DONE: &str = "Found 0 errors. Watching for file changes.";

    /// A stand-in watch tool: checksums every *.ts file under the working
    /// directory every 20ms and prints a cycle whenever the checksum moves.
    pub const FAKE_WATCHER: &str = r#"
        sum() { find . -name '*.ts' -type f | sort | xargs cat 2>/dev/null | cksum; }
        echo "Starting compilation in watch mode..."
        prev=$(sum)
        echo "Found 0 errors. Watching for file changes."
        while true; do
            sleep 0.02
            cur=$(sum)
            if [ "$cur" != "$prev" ]; then
                prev=$cur
                echo "File change detected. Starting incremental compilation..."
                sleep 0.03
                echo "Found 0 errors. Watching for file changes."
            fi
        done
    "#;

    pub fn settings(rounds: u32) -> BenchSettings {
        BenchSettings {
            rounds,
            sample_files: 3,
            poll_interval_ms: 10,
            initial_timeout_secs: 10,
            idle_timeout_secs: 10,
            completion_timeout_secs: 10,
            terminate_grace_ms: 500,
            ..BenchSettings::default()
        }
    }

    pub fn markers() -> MarkerConfig {
        MarkerConfig {
            start: START.to_string(),
            end: vec!["Watching for file changes.".to_string()],
            diagnostics: Some(r"Found (\d+) errors?".to_string()),
        }
    }

    pub fn fixture(name: &str, root: &Path) -> FixtureConfig {
        FixtureConfig {
            name: name.to_string(),
            root: root.to_path_buf(),
            extension: "ts".to_string(),
            exclude_dirs: vec!["node_modules".to_string()],
            exclude: vec![],
        }
    }

    pub fn tool(name: &str, script: &str) -> ToolConfig {
        ToolConfig {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    pub fn populate(root: &Path, count: usize) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        for i in 0..count {
            std::fs::write(
                root.join(format!("src/mod{i}.ts")),
                format!("export const value{i} = {i};\n"),
            )
            .unwrap();
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_build_args_replaces_root_placeholder() {
        let t = ToolConfig {
            name: "tsc".to_string(),
            command: "npx".to_string(),
            args: vec!["tsc".into(), "--watch".into(), "-p".into(), "{root}".into()],
            env: BTreeMap::new(),
        };
        let f = fixture("small", Path::new("/fixtures/small"));
        let spec = ScenarioSpec::new(&t, &f);
        assert_eq!(spec.label, "tsc/small");
        assert_eq!(spec.launch.args, vec!["tsc", "--watch", "-p", "/fixtures/small"]);
        assert_eq!(spec.launch.cwd, PathBuf::from("/fixtures/small"));
    }

    #[test]
    fn test_expand_matrix_and_filter() {
        let config = BenchConfig::parse(
            r#"
            [[tool]]
            name = "tsc"
            command = "tsc"
            [[tool]]
            name = "tsgo"
            command = "tsgo"
            [[fixture]]
            name = "small"
            root = "/a"
            [[fixture]]
            name = "large"
            root = "/b"
            "#,
        )
        .unwrap();

        let labels: Vec<String> = expand_matrix(&config, &[])
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["tsc/small", "tsc/large", "tsgo/small", "tsgo/large"]);

        let only = expand_matrix(&config, &["large".to_string()]);
        assert_eq!(only.len(), 2);
        assert!(only.iter().all(|s| s.label.ends_with("/large")));
    }

    #[tokio::test]
    async fn test_full_run_against_fake_watcher() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 4);
        let originals: Vec<_> = (0..4)
            .map(|i| std::fs::read(dir.path().join(format!("src/mod{i}.ts"))).unwrap())
            .collect();

        let spec = ScenarioSpec::new(&tool("fake", FAKE_WATCHER), &fixture("f", dir.path()));
        let outcome = run_scenario(&spec, &settings(3), &markers(), &mut rng()).await;

        assert!(outcome.error.is_none(), "error: {:?}", outcome.error);
        let stats = outcome.stats;
        assert_eq!(stats.status, RunStatus::Completed);
        assert_eq!(stats.samples.len(), 3);
        assert!(stats.initial_ms > 0.0);
        assert!(stats.min_ms > 0.0);
        assert!(stats.total_ms >= stats.initial_ms);
        assert_eq!(stats.diagnostics, Some(0));

        // Strip rounds drop the final newline and three rounds end on an
        // append; teardown puts the original bytes back either way.
        for (i, original) in originals.iter().enumerate() {
            let now = std::fs::read(dir.path().join(format!("src/mod{i}.ts"))).unwrap();
            assert_eq!(&now, original);
        }
    }

    #[tokio::test]
    async fn test_empty_fixture_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "no sources").unwrap();

        // The command would fail to spawn; EmptyFixture must win.
        let mut t = tool("missing", "");
        t.command = "nonexistent-watch-binary-xyz".to_string();
        let spec = ScenarioSpec::new(&t, &fixture("f", dir.path()));
        let outcome = run_scenario(&spec, &settings(2), &markers(), &mut rng()).await;

        let err = outcome.error.unwrap();
        assert!(err.is_empty_fixture());
        assert_eq!(outcome.stats, RunStatistics::failed());
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_zero_record() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 1);
        let mut t = tool("missing", "");
        t.command = "nonexistent-watch-binary-xyz".to_string();
        let spec = ScenarioSpec::new(&t, &fixture("f", dir.path()));

        let outcome = run_scenario(&spec, &settings(2), &markers(), &mut rng()).await;
        assert!(matches!(outcome.error, Some(ScenarioError::Spawn(_))));
        assert!(outcome.stats.is_failed());
    }

    #[tokio::test]
    async fn test_tool_that_exits_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 1);
        let spec = ScenarioSpec::new(
            &tool("crashy", "echo 'cannot find tsconfig' >&2; exit 2"),
            &fixture("f", dir.path()),
        );

        let outcome = run_scenario(&spec, &settings(2), &markers(), &mut rng()).await;
        let err = outcome.error.unwrap();
        assert!(matches!(err, ScenarioError::Exited(_)));
        assert!(outcome.stats.is_failed());
    }

    #[tokio::test]
    async fn test_silent_tool_times_out_with_zero_record() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 2);
        let spec = ScenarioSpec::new(
            &tool("silent", "echo 'booting'; sleep 30"),
            &fixture("f", dir.path()),
        );
        let mut s = settings(2);
        s.initial_timeout_secs = 1;

        let start = std::time::Instant::now();
        let outcome = run_scenario(&spec, &s, &markers(), &mut rng()).await;
        assert!(start.elapsed() < Duration::from_secs(5));

        let err = outcome.error.unwrap();
        assert!(matches!(err, ScenarioError::Timeout(_)));
        assert!(!err.to_string().is_empty());
        assert_eq!(outcome.stats, RunStatistics::failed());
    }

    #[tokio::test]
    async fn test_tool_that_stops_reacting_keeps_earlier_samples() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 2);
        // Reacts to the first change only, then goes quiet.
        let script = r#"
            sum() { find . -name '*.ts' -type f | sort | xargs cat | cksum; }
            echo "Found 0 errors. Watching for file changes."
            prev=$(sum)
            while true; do
                sleep 0.02
                cur=$(sum)
                if [ "$cur" != "$prev" ]; then
                    echo "File change detected. Starting incremental compilation..."
                    echo "Found 0 errors. Watching for file changes."
                    sleep 30
                fi
            done
        "#;
        let spec = ScenarioSpec::new(&tool("flaky", script), &fixture("f", dir.path()));
        let mut s = settings(4);
        s.completion_timeout_secs = 1;

        let outcome = run_scenario(&spec, &s, &markers(), &mut rng()).await;
        assert!(matches!(outcome.error, Some(ScenarioError::Timeout(_))));
        assert_eq!(outcome.stats.status, RunStatus::Partial);
        assert_eq!(outcome.stats.samples.len(), 1);
        assert!(outcome.stats.initial_ms > 0.0);

        // The failed strip round still leaves the fixture as it was found.
        for i in 0..2 {
            let now = std::fs::read_to_string(dir.path().join(format!("src/mod{i}.ts"))).unwrap();
            assert_eq!(now, format!("export const value{i} = {i};\n"));
        }
    }

    #[tokio::test]
    async fn test_locked_fixture_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), 1);
        let _held = FixtureLock::acquire(dir.path()).unwrap();

        let spec = ScenarioSpec::new(&tool("fake", FAKE_WATCHER), &fixture("f", dir.path()));
        let outcome = run_scenario(&spec, &settings(1), &markers(), &mut rng()).await;
        assert!(matches!(outcome.error, Some(ScenarioError::FixtureLocked(_))));
        assert!(outcome.stats.is_failed());
    }
}
