use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::error::CaptureError;
use crate::models::recording_result::{SessionStatus, StopOutcome, StopReport};
use crate::models::recording_type::{RecordingType, SourceKind};
use crate::models::state::StopReason;
use crate::traits::capture_backend::CaptureBackend;
use crate::traits::session_observer::SessionObserver;

use super::conflict::ConflictTable;
use super::recording_session::{RecordingSession, SessionPlan};

/// What `toggle` did.
#[derive(Debug)]
pub enum Toggled {
    Started(Arc<RecordingSession>),
    Stopped(StopOutcome),
}

#[derive(Default)]
struct Table {
    /// Sessions that are Starting, Active or Stopping.
    live: HashMap<RecordingType, Arc<RecordingSession>>,
    /// Most recent session per type that ended after reaching the registry's
    /// live set, kept for `status()`.
    last: HashMap<RecordingType, Arc<RecordingSession>>,
    shut_down: bool,
}

/// Process-wide table of at most one live session per recording type.
///
/// Registry operations (start, stop, toggle, stop all) are serialized; the
/// table itself is only locked for lookups and bookkeeping, never while a
/// session is being started or stopped, so sessions finishing on their own
/// can always deregister.
pub struct SessionRegistry {
    ops: Mutex<()>,
    table: Arc<Mutex<Table>>,
    conflicts: ConflictTable,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl SessionRegistry {
    pub fn new(conflicts: ConflictTable, observer: Option<Arc<dyn SessionObserver>>) -> Self {
        Self {
            ops: Mutex::new(()),
            table: Arc::new(Mutex::new(Table::default())),
            conflicts,
            observer,
        }
    }

    pub fn conflicts(&self) -> &ConflictTable {
        &self.conflicts
    }

    /// Start a session for `plan.recording_type`.
    ///
    /// Fails with `ResourceBusy` if that type, or a type it conflicts with,
    /// is live. The running session is never touched. A session that fails
    /// to start leaves no entry behind.
    pub fn start(&self, plan: SessionPlan, backend: &dyn CaptureBackend) -> Result<Arc<RecordingSession>, CaptureError> {
        let _ops = self.ops.lock();
        self.check_available(plan.recording_type)?;
        self.start_locked(plan, backend)
    }

    /// Stop the live session of `recording_type` and wait up to `grace`.
    ///
    /// Returns `NotActive` if nothing is live for the type.
    pub fn stop(&self, recording_type: RecordingType, reason: StopReason, grace: Duration) -> StopOutcome {
        let _ops = self.ops.lock();
        self.stop_locked(recording_type, reason, grace)
    }

    /// Stop the session if one is live, otherwise build a plan and start one.
    ///
    /// A session that already ended on its own counts as not live, even
    /// before its worker deregistered it. `make_plan` is only called when
    /// starting.
    pub fn toggle<F>(
        &self,
        recording_type: RecordingType,
        make_plan: F,
        backend: &dyn CaptureBackend,
        grace: Duration,
    ) -> Result<Toggled, CaptureError>
    where
        F: FnOnce() -> Result<SessionPlan, CaptureError>,
    {
        let _ops = self.ops.lock();
        let running = self
            .live_session(recording_type)
            .is_some_and(|session| !session.state().is_terminal());
        if running {
            return Ok(Toggled::Stopped(self.stop_locked(recording_type, StopReason::User, grace)));
        }

        self.check_available(recording_type)?;
        let plan = make_plan()?;
        if plan.recording_type != recording_type {
            return Err(CaptureError::ConfigurationFailed(format!(
                "plan for {} used to toggle {}",
                plan.recording_type, recording_type
            )));
        }
        self.start_locked(plan, backend).map(Toggled::Started)
    }

    /// Stop every live session.
    ///
    /// All sessions are asked to stop first, then each is waited on against
    /// the same deadline, so one unresponsive session costs at most `grace`
    /// and never delays the others' finalization.
    pub fn stop_all(&self, reason: StopReason, grace: Duration) -> Vec<StopReport> {
        let _ops = self.ops.lock();
        self.stop_all_locked(reason, grace)
    }

    /// Refuse new sessions and stop every live one.
    pub fn shutdown(&self, grace: Duration) -> Vec<StopReport> {
        let _ops = self.ops.lock();
        {
            let mut table = self.table.lock();
            if table.shut_down {
                return Vec::new();
            }
            table.shut_down = true;
        }
        log::info!("Session registry shutting down");
        self.stop_all_locked(StopReason::Shutdown, grace)
    }

    /// Change one source's volume on the running session of `recording_type`.
    pub fn set_volume(
        &self,
        recording_type: RecordingType,
        kind: SourceKind,
        percent: u16,
    ) -> Result<(), CaptureError> {
        let session = self
            .live_session(recording_type)
            .filter(|session| session.state().is_live())
            .ok_or_else(|| CaptureError::ConfigurationFailed(format!("{} is not recording", recording_type)))?;
        session.set_volume(kind, percent)
    }

    pub fn is_shut_down(&self) -> bool {
        self.table.lock().shut_down
    }

    /// One line per recording type that is live or has run.
    ///
    /// Live sessions take precedence over the last ended one. Ordered as
    /// `RecordingType::ALL`.
    pub fn status(&self) -> Vec<SessionStatus> {
        let table = self.table.lock();
        RecordingType::ALL
            .into_iter()
            .filter_map(|t| table.live.get(&t).or_else(|| table.last.get(&t)))
            .map(|session| session.status())
            .collect()
    }

    pub fn is_active(&self, recording_type: RecordingType) -> bool {
        self.live_session(recording_type)
            .is_some_and(|session| session.state().is_live())
    }

    pub fn active_count(&self) -> usize {
        self.table
            .lock()
            .live
            .values()
            .filter(|session| session.state().is_live())
            .count()
    }

    pub fn live_types(&self) -> Vec<RecordingType> {
        let table = self.table.lock();
        RecordingType::ALL
            .into_iter()
            .filter(|t| table.live.contains_key(t))
            .collect()
    }

    fn live_session(&self, recording_type: RecordingType) -> Option<Arc<RecordingSession>> {
        self.table.lock().live.get(&recording_type).cloned()
    }

    fn check_available(&self, requested: RecordingType) -> Result<(), CaptureError> {
        let mut table = self.table.lock();
        if table.shut_down {
            return Err(CaptureError::ShutDown);
        }
        // Sessions that concluded but whose exit hook has not run yet.
        let concluded: Vec<_> = table
            .live
            .iter()
            .filter(|(_, session)| session.state().is_terminal())
            .map(|(&recording_type, _)| recording_type)
            .collect();
        for recording_type in concluded {
            if let Some(session) = table.live.remove(&recording_type) {
                log::debug!("{} session {} retired before its exit hook", recording_type, session.id());
                table.last.insert(recording_type, session);
            }
        }
        if table.live.contains_key(&requested) {
            return Err(CaptureError::ResourceBusy {
                requested,
                active: requested,
            });
        }
        let mut live: Vec<_> = table.live.keys().copied().collect();
        live.sort();
        if let Some(active) = self.conflicts.first_conflict(requested, live) {
            log::warn!("{} refused: conflicts with live {}", requested, active);
            return Err(CaptureError::ResourceBusy { requested, active });
        }
        Ok(())
    }

    fn start_locked(&self, plan: SessionPlan, backend: &dyn CaptureBackend) -> Result<Arc<RecordingSession>, CaptureError> {
        let recording_type = plan.recording_type;
        let session = Arc::new(RecordingSession::new(plan, self.observer.clone()));
        let id = session.id();
        self.table.lock().live.insert(recording_type, Arc::clone(&session));

        let table = Arc::clone(&self.table);
        let on_exit = Box::new(move |exited: Uuid| {
            let mut table = table.lock();
            if table.live.get(&recording_type).is_some_and(|s| s.id() == exited) {
                if let Some(session) = table.live.remove(&recording_type) {
                    log::debug!("{} session {} left the registry", recording_type, exited);
                    table.last.insert(recording_type, session);
                }
            }
        });

        match session.start(backend, on_exit) {
            Ok(()) => Ok(session),
            Err(e) => {
                let mut table = self.table.lock();
                if table.live.get(&recording_type).is_some_and(|s| s.id() == id) {
                    table.live.remove(&recording_type);
                }
                if table.last.get(&recording_type).is_some_and(|s| s.id() == id) {
                    table.last.remove(&recording_type);
                }
                Err(e)
            }
        }
    }

    fn stop_locked(&self, recording_type: RecordingType, reason: StopReason, grace: Duration) -> StopOutcome {
        let Some(session) = self.live_session(recording_type) else {
            log::debug!("{} is not active, nothing to stop", recording_type);
            return StopOutcome::NotActive;
        };
        let outcome = session.stop(reason, grace);
        self.retire(&session);
        outcome
    }

    fn stop_all_locked(&self, reason: StopReason, grace: Duration) -> Vec<StopReport> {
        let sessions: Vec<_> = {
            let table = self.table.lock();
            RecordingType::ALL
                .into_iter()
                .filter_map(|t| table.live.get(&t).cloned())
                .collect()
        };
        if sessions.is_empty() {
            return Vec::new();
        }
        log::info!("Stopping {} session(s)", sessions.len());

        for session in &sessions {
            session.request_stop(reason);
        }
        let deadline = Instant::now() + grace;
        sessions
            .iter()
            .map(|session| {
                let outcome = session.wait_stopped(deadline);
                self.retire(session);
                StopReport {
                    recording_type: session.recording_type(),
                    outcome,
                }
            })
            .collect()
    }

    /// Move a terminal session from `live` to `last`.
    ///
    /// Normally the exit hook already did; an unresponsive session's worker
    /// is detached and may never run it.
    fn retire(&self, session: &Arc<RecordingSession>) {
        let recording_type = session.recording_type();
        let mut table = self.table.lock();
        if table.live.get(&recording_type).is_some_and(|s| s.id() == session.id()) {
            table.live.remove(&recording_type);
        }
        table.last.insert(recording_type, Arc::clone(session));
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::thread;

    use chrono::Local;

    use super::*;
    use crate::capture::synthetic::SyntheticBackend;
    use crate::models::audio_models::{ProcessTarget, SourceSpec};
    use crate::models::config::{ConflictPolicy, RecorderConfig};
    use crate::models::state::{FailureKind, SessionState};
    use crate::session::recording_session::SessionSettings;

    const GRACE: Duration = Duration::from_secs(3);

    fn plan(dir: &Path, recording_type: RecordingType) -> SessionPlan {
        let process = ProcessTarget::new(4242, "player");
        SessionPlan {
            recording_type,
            sources: recording_type
                .sources()
                .iter()
                .map(|kind| match kind {
                    SourceKind::Process => SourceSpec::Process {
                        target: process.clone(),
                    },
                    SourceKind::System => SourceSpec::System,
                    SourceKind::Microphone => SourceSpec::Microphone { device_id: None },
                })
                .collect(),
            process: recording_type.needs_focused_process().then(|| process.clone()),
            output_path: dir.join(format!("{}.wav", recording_type.label())),
            started_at: Local::now(),
            settings: SessionSettings::from_config(&RecorderConfig::default(), recording_type).unwrap(),
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(ConflictTable::exclusive(), None)
    }

    #[test]
    fn every_type_starts_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();

        for t in RecordingType::ALL {
            let session = registry.start(plan(dir.path(), t), &backend).unwrap();
            assert_eq!(session.state(), SessionState::Active, "{t}");
            assert!(registry.is_active(t));
            thread::sleep(Duration::from_millis(60));

            let outcome = registry.stop(t, StopReason::User, GRACE);
            assert!(outcome.is_finalized(), "{t}: {outcome:?}");
            assert!(!registry.is_active(t));
            assert_eq!(registry.stop(t, StopReason::User, GRACE), StopOutcome::NotActive);
        }
        assert_eq!(registry.active_count(), 0);
        assert_eq!(backend.active_captures(), 0);
        assert_eq!(registry.status().len(), RecordingType::ALL.len());
    }

    #[test]
    fn second_start_of_same_type_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        let first = registry
            .start(plan(dir.path(), RecordingType::System), &backend)
            .unwrap();

        let err = registry
            .start(plan(&dir.path().join("other"), RecordingType::System), &backend)
            .unwrap_err();
        assert_eq!(
            err,
            CaptureError::ResourceBusy {
                requested: RecordingType::System,
                active: RecordingType::System
            }
        );
        assert_eq!(first.state(), SessionState::Active);
        assert!(registry.stop(RecordingType::System, StopReason::User, GRACE).is_finalized());
    }

    #[test]
    fn conflicting_mix_is_refused_and_microphone_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        let mic = registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();
        let opens = backend.open_count();

        let err = registry
            .start(plan(dir.path(), RecordingType::MixSystemMic), &backend)
            .unwrap_err();
        assert_eq!(
            err,
            CaptureError::ResourceBusy {
                requested: RecordingType::MixSystemMic,
                active: RecordingType::Microphone
            }
        );
        // Refused before any device was touched.
        assert_eq!(backend.open_count(), opens);
        assert_eq!(mic.state(), SessionState::Active);
        assert_eq!(registry.live_types(), vec![RecordingType::Microphone]);
        assert!(!dir.path().join("mix-system-mic.wav").exists());

        assert!(registry
            .stop(RecordingType::Microphone, StopReason::User, GRACE)
            .is_finalized());
    }

    #[test]
    fn shared_taps_allow_mix_next_to_its_sources() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = SessionRegistry::new(ConflictTable::from_policy(ConflictPolicy::SharedTaps), None);
        registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();
        registry
            .start(plan(dir.path(), RecordingType::MixSystemMic), &backend)
            .unwrap();
        assert_eq!(registry.active_count(), 2);

        let reports = registry.stop_all(StopReason::StopAll, GRACE);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.outcome.is_finalized()));
    }

    #[test]
    fn system_and_microphone_run_together_and_stop_all_finalizes_both() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        registry
            .start(plan(dir.path(), RecordingType::System), &backend)
            .unwrap();
        registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();
        assert!(registry.is_active(RecordingType::System));
        assert!(registry.is_active(RecordingType::Microphone));
        thread::sleep(Duration::from_millis(150));

        let reports = registry.stop_all(StopReason::StopAll, GRACE);
        let types: Vec<_> = reports.iter().map(|r| r.recording_type).collect();
        assert_eq!(types, vec![RecordingType::System, RecordingType::Microphone]);

        let mut paths = Vec::new();
        for report in reports {
            match report.outcome {
                StopOutcome::Finalized(result) => {
                    let reader = hound::WavReader::open(&result.file_path).unwrap();
                    assert!(reader.duration() > 0);
                    paths.push(result.file_path);
                }
                other => panic!("{}: {:?}", report.recording_type, other),
            }
        }
        assert_ne!(paths[0], paths[1]);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.stop_all(StopReason::StopAll, GRACE).is_empty());
    }

    #[test]
    fn failed_start_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.remove_device(SourceKind::Microphone);
        let registry = registry();

        let err = registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert!(!registry.is_active(RecordingType::Microphone));
        assert!(registry.status().is_empty());
        assert!(!dir.path().join("microphone.wav").exists());
    }

    #[test]
    fn interrupted_session_deregisters_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        registry
            .start(plan(dir.path(), RecordingType::FocusedProcess), &backend)
            .unwrap();
        thread::sleep(Duration::from_millis(80));
        backend.terminate_process(4242);

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.is_active(RecordingType::FocusedProcess) || !registry.live_types().is_empty() {
            assert!(Instant::now() < deadline, "session never deregistered");
            thread::sleep(Duration::from_millis(10));
        }

        let status = registry.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, SessionState::Failed);
        assert!(status[0].was_interrupted());
        assert_eq!(
            registry.stop(RecordingType::FocusedProcess, StopReason::User, GRACE),
            StopOutcome::NotActive
        );
    }

    #[test]
    fn unresponsive_session_does_not_block_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.hang_on_close(SourceKind::System);
        let registry = registry();
        registry
            .start(plan(dir.path(), RecordingType::System), &backend)
            .unwrap();
        registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let begun = Instant::now();
        let reports = registry.stop_all(StopReason::StopAll, Duration::from_millis(400));
        assert!(begun.elapsed() < Duration::from_secs(2));

        for report in &reports {
            match (report.recording_type, &report.outcome) {
                (RecordingType::System, StopOutcome::Failed(failure)) => {
                    assert_eq!(failure.kind, FailureKind::Unresponsive)
                }
                (RecordingType::Microphone, outcome) => assert!(outcome.is_finalized(), "{outcome:?}"),
                other => panic!("unexpected report {:?}", other),
            }
        }
        assert!(registry.live_types().is_empty());
        backend.release_hung();
    }

    #[test]
    fn toggle_starts_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();

        let started = registry
            .toggle(RecordingType::System, || Ok(plan(dir.path(), RecordingType::System)), &backend, GRACE)
            .unwrap();
        assert!(matches!(started, Toggled::Started(_)));
        thread::sleep(Duration::from_millis(50));

        let stopped = registry
            .toggle(
                RecordingType::System,
                || panic!("no plan needed to stop"),
                &backend,
                GRACE,
            )
            .unwrap();
        match stopped {
            Toggled::Stopped(outcome) => assert!(outcome.is_finalized()),
            Toggled::Started(_) => panic!("toggle started a second session"),
        }
    }

    #[test]
    fn toggle_starts_fresh_when_the_live_session_already_ended() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();

        backend.fail_open(SourceKind::System, CaptureError::DeviceUnavailable("unplugged".into()));
        let ended = Arc::new(RecordingSession::new(plan(dir.path(), RecordingType::System), None));
        assert!(ended.start(&backend, Box::new(|_: Uuid| {})).is_err());
        assert!(ended.state().is_terminal());
        backend.clear_open_failure(SourceKind::System);
        // Concluded, but still registered as its exit hook would find it.
        registry
            .table
            .lock()
            .live
            .insert(RecordingType::System, Arc::clone(&ended));

        let toggled = registry
            .toggle(
                RecordingType::System,
                || Ok(plan(&dir.path().join("next"), RecordingType::System)),
                &backend,
                GRACE,
            )
            .unwrap();
        match toggled {
            Toggled::Started(session) => {
                assert_ne!(session.id(), ended.id());
                assert_eq!(session.state(), SessionState::Active);
            }
            other => panic!("unexpected toggle {:?}", other),
        }
        assert!(registry.stop(RecordingType::System, StopReason::User, GRACE).is_finalized());
    }

    #[test]
    fn volume_reaches_the_running_session_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        assert!(registry
            .set_volume(RecordingType::Microphone, SourceKind::Microphone, 50)
            .is_err());

        let session = registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();
        registry
            .set_volume(RecordingType::Microphone, SourceKind::Microphone, 250)
            .unwrap();
        assert_eq!(session.volume(SourceKind::Microphone), Ok(200));
        assert!(registry.stop(RecordingType::Microphone, StopReason::User, GRACE).is_finalized());
    }

    #[test]
    fn shutdown_stops_everything_and_refuses_new_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let registry = registry();
        registry
            .start(plan(dir.path(), RecordingType::Microphone), &backend)
            .unwrap();

        let reports = registry.shutdown(GRACE);
        assert_eq!(reports.len(), 1);
        match &reports[0].outcome {
            StopOutcome::Finalized(result) => {
                assert_eq!(result.metadata.stop_reason, StopReason::Shutdown)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(registry.is_shut_down());
        assert_eq!(
            registry
                .start(plan(dir.path(), RecordingType::System), &backend)
                .unwrap_err(),
            CaptureError::ShutDown
        );
        assert!(registry.shutdown(GRACE).is_empty());
    }
}
