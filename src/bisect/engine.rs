//! The bisection state machine: `INITIALIZING -> ACTIVE -> (COMPLETE | ABANDONED)`.
//!
//! Every change to the window is persisted before the next tester call, so a run can
//! be killed at any point and resumed with at most one redundant test.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BisectError, Commit, CommitRange, Verdict};
use crate::storage::{ResultCache, SessionState, SessionStatus, SessionStore, WorkflowKey};
use crate::tester::retry::{duration_secs, jittered};
use crate::tester::{RetryConfig, Tester};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Extra attempts for a candidate after an INCONCLUSIVE verdict.
    pub inconclusive_retries: u32,

    #[serde(with = "duration_secs")]
    pub inconclusive_delay: Duration,

    #[serde(with = "duration_secs")]
    pub inconclusive_max_delay: Duration,

    pub inconclusive_multiplier: f64,

    /// Record INCONCLUSIVE verdicts in the cache (they are never used to narrow).
    pub cache_inconclusive: bool,
}

impl EngineConfig {
    fn backoff(&self) -> RetryConfig {
        RetryConfig::new(
            self.inconclusive_retries,
            self.inconclusive_delay,
            self.inconclusive_max_delay,
            self.inconclusive_multiplier,
        )
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inconclusive_retries: 2,
            inconclusive_delay: Duration::from_secs(60),
            inconclusive_max_delay: Duration::from_secs(600),
            inconclusive_multiplier: 2.0,
            cache_inconclusive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A candidate stayed INCONCLUSIVE through every retry.
#[derive(Debug, Clone, Error)]
#[error("commit {commit} was inconclusive {attempts} times in a row")]
pub struct InconclusiveExhausted {
    pub commit: String,
    pub attempts: u32,
}

/// The `[lo, hi]` window with the SHAs it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    pub lo: usize,
    pub hi: usize,
    pub good: String,
    pub bad: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete {
        culprit: Commit,
        index: usize,
        tester_invocations: u32,
    },
    Abandoned {
        window: Window,
        reason: String,
        tester_invocations: u32,
    },
    Interrupted {
        window: Window,
        in_flight: Option<String>,
    },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Complete { .. } => 0,
            Outcome::Abandoned { .. } => 2,
            Outcome::Interrupted { .. } => 130,
        }
    }
}

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// What to do with a session already stored for the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeChoice {
    /// Resume an ACTIVE session, refuse an ABANDONED one.
    #[default]
    Auto,
    /// Also reopen an ABANDONED session at its saved window.
    Resume,
    /// Discard whatever is stored and start over.
    Fresh,
}

/// The session a run will drive, after validation against the current commit range.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub state: SessionState,
    pub resumed: bool,
}

impl SessionPlan {
    pub fn prepare(
        sessions: &SessionStore,
        key: &WorkflowKey,
        range: &CommitRange,
        choice: ResumeChoice,
    ) -> Result<Self, BisectError> {
        let Some(mut existing) = sessions.load(key)? else {
            return Self::fresh(sessions, key, range);
        };

        if choice == ResumeChoice::Fresh || existing.status == SessionStatus::Complete {
            info!(%key, status = %existing.status, lo = existing.lo, hi = existing.hi, "discarding saved session");
            sessions.clear(key)?;
            return Self::fresh(sessions, key, range);
        }

        if let Some(reason) = stale_reason(&existing, range) {
            warn!(%key, %reason, "saved session is stale");
            return Err(BisectError::StaleSession {
                key: key.to_string(),
                reason,
            });
        }

        if !existing.window_is_valid() {
            return Err(BisectError::InvalidWindow {
                lo: existing.lo,
                hi: existing.hi,
                len: existing.commit_range_snapshot.len(),
            });
        }

        if existing.status == SessionStatus::Abandoned {
            if choice != ResumeChoice::Resume {
                return Err(BisectError::AbandonedSession {
                    key: key.to_string(),
                    lo: existing.lo,
                    hi: existing.hi,
                    reason: existing.abandon_reason.clone(),
                });
            }
            info!(%key, reason = ?existing.abandon_reason, "reopening abandoned session");
            existing.status = SessionStatus::Active;
            existing.abandon_reason = None;
        }

        if let Some(commit) = &existing.in_flight {
            warn!(%key, %commit, "previous run stopped while this commit was being tested");
        }
        info!(
            %key,
            lo = existing.lo,
            hi = existing.hi,
            remaining = CommitRange::candidates_between(existing.lo, existing.hi),
            "resuming session"
        );
        sessions.save(&mut existing)?;
        Ok(Self {
            state: existing,
            resumed: true,
        })
    }

    fn fresh(sessions: &SessionStore, key: &WorkflowKey, range: &CommitRange) -> Result<Self, BisectError> {
        let mut state = SessionState::new(key, range.shas());
        sessions.save(&mut state)?;
        info!(%key, commits = range.len(), good = %range.good().sha, bad = %range.bad().sha, "started new session");
        Ok(Self { state, resumed: false })
    }
}

fn stale_reason(state: &SessionState, range: &CommitRange) -> Option<String> {
    if state.good_boundary != range.good().sha || state.bad_boundary != range.bad().sha {
        return Some(format!(
            "it bisects {}..{}, not {}..{}",
            state.good_boundary,
            state.bad_boundary,
            range.good().sha,
            range.bad().sha
        ));
    }
    if state.commit_range_snapshot != range.shas() {
        return Some(format!(
            "commit history changed since it started ({} commits then, {} now)",
            state.commit_range_snapshot.len(),
            range.len()
        ));
    }
    None
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum Step {
    Narrowed,
    Interrupted,
    Exhausted(InconclusiveExhausted),
}

pub struct BisectionEngine {
    key: WorkflowKey,
    range: CommitRange,
    state: SessionState,
    cache: ResultCache,
    sessions: SessionStore,
    tester: Arc<dyn Tester>,
    config: EngineConfig,
    cancel: CancellationToken,
    visited: Vec<String>,
}

impl BisectionEngine {
    pub fn new(
        range: CommitRange,
        plan: SessionPlan,
        cache: ResultCache,
        sessions: SessionStore,
        tester: Arc<dyn Tester>,
    ) -> Self {
        Self {
            key: plan.state.key(),
            range,
            state: plan.state,
            cache,
            sessions,
            tester,
            config: EngineConfig::default(),
            cancel: CancellationToken::new(),
            visited: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Candidates consulted so far, cached or tested, in order.
    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    /// Drive the session until it completes, is abandoned, or is interrupted.
    ///
    /// An error leaves the session ABANDONED with the error as its reason.
    pub async fn run(&mut self) -> Result<Outcome, BisectError> {
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if self.state.status == SessionStatus::Active {
                    if let Err(save_err) = self.sessions.abandon(&mut self.state, e.to_string()) {
                        warn!(error = %save_err, "could not record abandoned session");
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<Outcome, BisectError> {
        info!(key = %self.key, commits = self.range.len(), lo = self.state.lo, hi = self.state.hi, "bisecting");
        loop {
            let (lo, hi) = self.state.window();
            if !self.state.window_is_valid() || self.state.commit_range_snapshot.len() != self.range.len() {
                return Err(BisectError::InvalidWindow {
                    lo,
                    hi,
                    len: self.range.len(),
                });
            }

            if self.cancel.is_cancelled() {
                return self.interrupt();
            }
            if CommitRange::is_settled(lo, hi) {
                return self.complete();
            }

            let index = CommitRange::midpoint(lo, hi);
            let commit = self.sha(index).to_string();
            self.visited.push(commit.clone());
            info!(
                %commit,
                index,
                lo,
                hi,
                remaining = CommitRange::candidates_between(lo, hi),
                "next candidate"
            );

            match self.cache.get(&self.key, &commit)? {
                Some(verdict) if verdict.is_terminal() => {
                    info!(%commit, %verdict, "using cached verdict");
                    self.narrow(index, verdict)?;
                    continue;
                }
                Some(Verdict::Pending) => {
                    warn!(%commit, "a test of this commit was interrupted earlier; testing again");
                }
                Some(_) => debug!(%commit, "cached verdict is inconclusive; testing again"),
                None => {}
            }

            match self.test_candidate(index, &commit).await? {
                Step::Narrowed => {}
                Step::Interrupted => return self.interrupt(),
                Step::Exhausted(exhausted) => {
                    let reason = exhausted.to_string();
                    self.sessions.abandon(&mut self.state, reason.clone())?;
                    return Ok(Outcome::Abandoned {
                        window: self.window(),
                        reason,
                        tester_invocations: self.state.tester_invocations,
                    });
                }
            }
        }
    }

    async fn test_candidate(&mut self, index: usize, commit: &str) -> Result<Step, BisectError> {
        let backoff = self.config.backoff();
        let mut attempt = 0u32;
        loop {
            self.state.in_flight = Some(commit.to_string());
            self.state.tester_invocations += 1;
            self.sessions.save(&mut self.state)?;

            let verdict = self.tester.test(&self.key, commit, &self.cancel).await;
            info!(%commit, %verdict, attempt = attempt + 1, "tester verdict");

            match verdict {
                Verdict::Good | Verdict::Bad => {
                    self.cache.put(&self.key, commit, verdict)?;
                    self.state.in_flight = None;
                    self.narrow(index, verdict)?;
                    return Ok(Step::Narrowed);
                }
                Verdict::Pending => {
                    self.cache.mark_pending(&self.key, commit)?;
                    return Ok(Step::Interrupted);
                }
                Verdict::Inconclusive => {
                    if self.cancel.is_cancelled() {
                        self.state.in_flight = None;
                        return Ok(Step::Interrupted);
                    }
                    if self.config.cache_inconclusive {
                        self.cache.put(&self.key, commit, Verdict::Inconclusive)?;
                    }
                    if attempt >= backoff.max_retries {
                        self.state.in_flight = None;
                        return Ok(Step::Exhausted(InconclusiveExhausted {
                            commit: commit.to_string(),
                            attempts: attempt + 1,
                        }));
                    }

                    let delay = jittered(backoff.delay_for_attempt(attempt));
                    attempt += 1;
                    warn!(%commit, attempt, max_retries = backoff.max_retries, ?delay, "inconclusive verdict, retrying");

                    let cancel = self.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.state.in_flight = None;
                            return Ok(Step::Interrupted);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Move `lo` or `hi` to `index`. `index` must lie strictly inside the window.
    fn narrow(&mut self, index: usize, verdict: Verdict) -> Result<(), BisectError> {
        let (lo, hi) = self.state.window();
        if index <= lo || index >= hi {
            return Err(BisectError::InvalidWindow {
                lo,
                hi,
                len: self.range.len(),
            });
        }
        match verdict {
            Verdict::Good => self.state.lo = index,
            Verdict::Bad => self.state.hi = index,
            Verdict::Inconclusive | Verdict::Pending => return Ok(()),
        }
        debug!(lo = self.state.lo, hi = self.state.hi, %verdict, "narrowed window");
        self.sessions.save(&mut self.state)?;
        Ok(())
    }

    fn complete(&mut self) -> Result<Outcome, BisectError> {
        let index = self.state.hi;
        let culprit = self.range.get(index).cloned().ok_or(BisectError::InvalidWindow {
            lo: self.state.lo,
            hi: index,
            len: self.range.len(),
        })?;

        self.state.status = SessionStatus::Complete;
        self.state.in_flight = None;
        self.sessions.save(&mut self.state)?;
        self.sessions.clear(&self.key)?;

        info!(
            culprit = %culprit.sha,
            subject = culprit.subject(),
            tester_invocations = self.state.tester_invocations,
            "found culprit"
        );
        Ok(Outcome::Complete {
            culprit,
            index,
            tester_invocations: self.state.tester_invocations,
        })
    }

    fn interrupt(&mut self) -> Result<Outcome, BisectError> {
        self.sessions.save(&mut self.state)?;
        info!(
            lo = self.state.lo,
            hi = self.state.hi,
            in_flight = ?self.state.in_flight,
            "bisection interrupted; rerun the same command to resume"
        );
        Ok(Outcome::Interrupted {
            window: self.window(),
            in_flight: self.state.in_flight.clone(),
        })
    }

    fn sha(&self, index: usize) -> &str {
        self.range.sha(index).unwrap_or_default()
    }

    fn window(&self) -> Window {
        Window {
            lo: self.state.lo,
            hi: self.state.hi,
            good: self.sha(self.state.lo).to_string(),
            bad: self.sha(self.state.hi).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use crate::storage::{CacheMode, KvStore, MemoryStore};

    #[derive(Default)]
    struct FakeTester {
        shas: Vec<String>,
        first_bad: usize,
        always: Option<Verdict>,
        script: Mutex<HashMap<String, VecDeque<Verdict>>>,
        interrupt_on_call: Option<usize>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTester {
        fn new(range: &CommitRange, first_bad: usize) -> Self {
            Self {
                shas: range.shas(),
                first_bad,
                ..Default::default()
            }
        }

        fn script(self, commit: &str, verdicts: &[Verdict]) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(commit.to_string(), verdicts.iter().copied().collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Tester for FakeTester {
        async fn test(&self, _key: &WorkflowKey, commit: &str, cancel: &CancellationToken) -> Verdict {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(commit.to_string());
                calls.len()
            };
            if self.interrupt_on_call == Some(n) {
                cancel.cancel();
                return Verdict::Pending;
            }
            if let Some(v) = self.always {
                return v;
            }
            if let Some(v) = self.script.lock().unwrap().get_mut(commit).and_then(|q| q.pop_front()) {
                return v;
            }
            let index = self.shas.iter().position(|s| s == commit).unwrap();
            if index >= self.first_bad {
                Verdict::Bad
            } else {
                Verdict::Good
            }
        }
    }

    fn commits(n: usize) -> CommitRange {
        let mut all: Vec<Commit> = (0..n).map(|i| Commit::new(format!("c{}", i), format!("change {}", i))).collect();
        let good = all.remove(0);
        CommitRange::new(good, all).unwrap()
    }

    fn key() -> WorkflowKey {
        WorkflowKey::new("owner/repo", "ci.yml", None)
    }

    fn stores() -> (ResultCache, SessionStore) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        (ResultCache::new(kv.clone()), SessionStore::new(kv))
    }

    fn quick() -> EngineConfig {
        EngineConfig {
            inconclusive_delay: Duration::ZERO,
            inconclusive_max_delay: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    async fn bisect(
        range: &CommitRange,
        tester: Arc<FakeTester>,
        cache: &ResultCache,
        sessions: &SessionStore,
        choice: ResumeChoice,
    ) -> (Result<Outcome, BisectError>, Vec<String>) {
        let plan = SessionPlan::prepare(sessions, &key(), range, choice).unwrap();
        let mut engine = BisectionEngine::new(range.clone(), plan, cache.clone(), sessions.clone(), tester)
            .with_config(quick());
        let outcome = engine.run().await;
        (outcome, engine.visited().to_vec())
    }

    fn ceil_log2(n: usize) -> u32 {
        usize::BITS - (n - 1).leading_zeros()
    }

    #[tokio::test]
    async fn test_eight_commits_transition_at_c4() {
        let range = commits(8);
        let (cache, sessions) = stores();
        let tester = Arc::new(FakeTester::new(&range, 4));

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        match outcome.unwrap() {
            Outcome::Complete {
                culprit,
                index,
                tester_invocations,
            } => {
                assert_eq!(culprit.sha, "c4");
                assert_eq!(culprit.subject(), "change 4");
                assert_eq!(index, 4);
                assert_eq!(tester_invocations, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(tester.calls(), vec!["c3", "c5", "c4"]);
        assert_eq!(cache.get(&key(), "c3").unwrap(), Some(Verdict::Good));
        assert_eq!(cache.get(&key(), "c5").unwrap(), Some(Verdict::Bad));
        assert!(sessions.load(&key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finds_every_transition_point_within_log2_tests() {
        for n in 2..=64 {
            for first_bad in 1..n {
                let range = commits(n);
                let (cache, sessions) = stores();
                let tester = Arc::new(FakeTester::new(&range, first_bad));

                let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
                match outcome.unwrap() {
                    Outcome::Complete {
                        index,
                        tester_invocations,
                        ..
                    } => {
                        assert_eq!(index, first_bad, "n={n}");
                        assert!(tester_invocations <= ceil_log2(n), "n={n} first_bad={first_bad}");
                    }
                    other => panic!("unexpected outcome: {other:?}"),
                }
                for entry in cache.entries("owner/repo", "ci.yml", None).unwrap() {
                    let i = range.shas().iter().position(|s| *s == entry.commit).unwrap();
                    let expected = if i >= first_bad { Verdict::Bad } else { Verdict::Good };
                    assert_eq!(entry.verdict, expected);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_populated_cache_needs_no_tests() {
        let range = commits(16);
        let (cache, sessions) = stores();
        for (i, sha) in range.shas().iter().enumerate() {
            let v = if i >= 11 { Verdict::Bad } else { Verdict::Good };
            cache.put(&key(), sha, v).unwrap();
        }
        let tester = Arc::new(FakeTester::new(&range, 11));

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        assert!(matches!(outcome.unwrap(), Outcome::Complete { index: 11, tester_invocations: 0, .. }));
        assert!(tester.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_only_cache_still_tests() {
        let range = commits(8);
        let (cache, sessions) = stores();
        cache.put(&key(), "c3", Verdict::Good).unwrap();
        let cache = cache.with_mode(CacheMode::WriteOnly);
        let tester = Arc::new(FakeTester::new(&range, 4));

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        assert!(matches!(outcome.unwrap(), Outcome::Complete { index: 4, .. }));
        assert_eq!(tester.calls(), vec!["c3", "c5", "c4"]);
    }

    #[tokio::test]
    async fn test_candidate_sequence_is_deterministic() {
        let range = commits(37);
        let mut sequences = Vec::new();
        for _ in 0..2 {
            let (cache, sessions) = stores();
            let tester = Arc::new(FakeTester::new(&range, 23));
            let (_, visited) = bisect(&range, tester, &cache, &sessions, ResumeChoice::Auto).await;
            sequences.push(visited);
        }
        assert_eq!(sequences[0], sequences[1]);
    }

    #[tokio::test]
    async fn test_resume_after_interrupt_finds_same_culprit() {
        let range = commits(32);
        let (cache, sessions) = stores();

        let uninterrupted = Arc::new(FakeTester::new(&range, 19));
        let (baseline_cache, baseline_sessions) = stores();
        bisect(&range, uninterrupted.clone(), &baseline_cache, &baseline_sessions, ResumeChoice::Auto).await;
        let baseline = uninterrupted.calls().len();

        let first = Arc::new(FakeTester {
            interrupt_on_call: Some(3),
            ..FakeTester::new(&range, 19)
        });
        let (outcome, _) = bisect(&range, first.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        let in_flight = match outcome.unwrap() {
            Outcome::Interrupted { in_flight, .. } => in_flight.unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(cache.get(&key(), &in_flight).unwrap(), Some(Verdict::Pending));
        let saved = sessions.load(&key()).unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Active);
        assert_eq!(saved.in_flight.as_deref(), Some(in_flight.as_str()));

        let second = Arc::new(FakeTester::new(&range, 19));
        let (outcome, _) = bisect(&range, second.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        assert!(matches!(outcome.unwrap(), Outcome::Complete { index: 19, .. }));
        assert_eq!(second.calls()[0], in_flight);
        assert!(first.calls().len() + second.calls().len() <= baseline + 1);
        assert_eq!(cache.get(&key(), &in_flight).unwrap().map(|v| v.is_terminal()), Some(true));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let range = commits(8);
        let (cache, sessions) = stores();
        let tester = Arc::new(FakeTester::new(&range, 4));
        let plan = SessionPlan::prepare(&sessions, &key(), &range, ResumeChoice::Auto).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut engine = BisectionEngine::new(range.clone(), plan, cache, sessions.clone(), tester.clone())
            .with_cancellation(cancel);
        match engine.run().await.unwrap() {
            Outcome::Interrupted { window, in_flight } => {
                assert_eq!((window.lo, window.hi), (0, 7));
                assert_eq!(window.good, "c0");
                assert_eq!(window.bad, "c7");
                assert!(in_flight.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(tester.calls().is_empty());
        assert!(sessions.load(&key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_changed_history_is_stale() {
        let range = commits(8);
        let (_, sessions) = stores();
        let mut state = SessionState::new(&key(), range.shas());
        state.lo = 3;
        sessions.save(&mut state).unwrap();

        let mut shas = range.shas();
        shas[2] = "rewritten".into();
        let rewritten = CommitRange::from_snapshot(&shas).unwrap();

        let err = SessionPlan::prepare(&sessions, &key(), &rewritten, ResumeChoice::Auto).unwrap_err();
        assert!(matches!(err, BisectError::StaleSession { .. }), "{err}");
        let kept = sessions.load(&key()).unwrap().unwrap();
        assert_eq!(kept.window(), (3, 7));

        let err = SessionPlan::prepare(&sessions, &key(), &commits(9), ResumeChoice::Resume).unwrap_err();
        assert!(matches!(err, BisectError::StaleSession { .. }), "{err}");

        let plan = SessionPlan::prepare(&sessions, &key(), &rewritten, ResumeChoice::Fresh).unwrap();
        assert!(!plan.resumed);
        assert_eq!(plan.state.window(), (0, 7));
        assert_eq!(plan.state.commit_range_snapshot, shas);
    }

    #[tokio::test]
    async fn test_corrupt_window_is_rejected() {
        let range = commits(8);
        let (_, sessions) = stores();
        let mut state = SessionState::new(&key(), range.shas());
        state.lo = 5;
        state.hi = 3;
        sessions.save(&mut state).unwrap();

        let err = SessionPlan::prepare(&sessions, &key(), &range, ResumeChoice::Auto).unwrap_err();
        assert!(matches!(err, BisectError::InvalidWindow { lo: 5, hi: 3, len: 8 }));
    }

    #[tokio::test]
    async fn test_inconclusive_exhaustion_abandons_with_full_window() {
        let range = commits(8);
        let (cache, sessions) = stores();
        let tester = Arc::new(FakeTester {
            always: Some(Verdict::Inconclusive),
            ..FakeTester::new(&range, 4)
        });

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        match outcome.unwrap() {
            Outcome::Abandoned {
                window,
                reason,
                tester_invocations,
            } => {
                assert_eq!((window.lo, window.hi), (0, 7));
                assert_eq!(tester_invocations, 3);
                assert!(reason.contains("c3"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(tester.calls(), vec!["c3", "c3", "c3"]);
        assert_eq!(cache.get(&key(), "c3").unwrap(), None);

        let saved = sessions.load(&key()).unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Abandoned);
        assert!(saved.in_flight.is_none());

        let err = SessionPlan::prepare(&sessions, &key(), &range, ResumeChoice::Auto).unwrap_err();
        assert!(matches!(err, BisectError::AbandonedSession { lo: 0, hi: 7, .. }));

        let plan = SessionPlan::prepare(&sessions, &key(), &range, ResumeChoice::Resume).unwrap();
        assert!(plan.resumed);
        assert_eq!(plan.state.status, SessionStatus::Active);
        assert!(plan.state.abandon_reason.is_none());
    }

    #[tokio::test]
    async fn test_inconclusive_then_verdict_continues() {
        let range = commits(8);
        let (cache, sessions) = stores();
        let tester = Arc::new(FakeTester::new(&range, 4).script("c5", &[Verdict::Inconclusive]));

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        assert!(matches!(
            outcome.unwrap(),
            Outcome::Complete {
                index: 4,
                tester_invocations: 4,
                ..
            }
        ));
        assert_eq!(tester.calls(), vec!["c3", "c5", "c5", "c4"]);
    }

    #[tokio::test]
    async fn test_cache_inconclusive_records_but_does_not_narrow() {
        let range = commits(4);
        let (cache, sessions) = stores();
        let tester = Arc::new(FakeTester {
            always: Some(Verdict::Inconclusive),
            ..FakeTester::new(&range, 2)
        });
        let plan = SessionPlan::prepare(&sessions, &key(), &range, ResumeChoice::Auto).unwrap();
        let config = EngineConfig {
            inconclusive_retries: 0,
            cache_inconclusive: true,
            ..quick()
        };
        let mut engine =
            BisectionEngine::new(range.clone(), plan, cache.clone(), sessions, tester.clone()).with_config(config);

        assert!(matches!(engine.run().await.unwrap(), Outcome::Abandoned { .. }));
        assert_eq!(tester.calls().len(), 1);
        assert_eq!(cache.get(&key(), "c1").unwrap(), Some(Verdict::Inconclusive));
    }

    #[tokio::test]
    async fn test_pending_entry_is_retested() {
        let range = commits(8);
        let (cache, sessions) = stores();
        cache.mark_pending(&key(), "c3").unwrap();
        let tester = Arc::new(FakeTester::new(&range, 4));

        let (outcome, _) = bisect(&range, tester.clone(), &cache, &sessions, ResumeChoice::Auto).await;
        assert!(matches!(outcome.unwrap(), Outcome::Complete { index: 4, .. }));
        assert_eq!(tester.calls()[0], "c3");
        assert_eq!(cache.get(&key(), "c3").unwrap(), Some(Verdict::Good));
    }

    #[tokio::test]
    async fn test_conflicting_verdict_abandons_session() {
        let range = commits(8);
        let (cache, sessions) = stores();
        cache.put(&key(), "c3", Verdict::Bad).unwrap();
        let cache = cache.with_mode(CacheMode::WriteOnly);
        let tester = Arc::new(FakeTester::new(&range, 4));

        let (outcome, _) = bisect(&range, tester, &cache, &sessions, ResumeChoice::Auto).await;
        let err = outcome.unwrap_err();
        assert!(matches!(err, BisectError::CacheConsistency(_)), "{err}");

        let saved = sessions.load(&key()).unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Abandoned);
        assert_eq!(saved.window(), (0, 7));
        assert!(saved.abandon_reason.as_deref().unwrap().contains("c3"));
    }

    #[test]
    fn test_exit_codes() {
        let window = Window {
            lo: 0,
            hi: 1,
            good: "a".into(),
            bad: "b".into(),
        };
        assert_eq!(
            Outcome::Complete {
                culprit: Commit::new("b", ""),
                index: 1,
                tester_invocations: 0
            }
            .exit_code(),
            0
        );
        assert_eq!(
            Outcome::Abandoned {
                window: window.clone(),
                reason: String::new(),
                tester_invocations: 0
            }
            .exit_code(),
            2
        );
        assert_eq!(Outcome::Interrupted { window, in_flight: None }.exit_code(), 130);
    }

    #[test]
    fn test_engine_config_from_toml() {
        let config: EngineConfig = toml::from_str("inconclusive_retries = 5\ninconclusive_delay = 1.5").unwrap();
        assert_eq!(config.inconclusive_retries, 5);
        assert_eq!(config.inconclusive_delay, Duration::from_millis(1500));
        assert!(!config.cache_inconclusive);
    }
}
