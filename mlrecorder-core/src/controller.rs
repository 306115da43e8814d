use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;

use crate::models::audio_models::{InputDevice, SourceSpec};
use crate::models::config::RecorderConfig;
use crate::models::error::CaptureError;
use crate::models::recording_result::{SessionStatus, StopOutcome, StopReport, ToggleResult};
use crate::models::recording_type::{RecordingType, SourceKind};
use crate::models::state::StopReason;
use crate::session::conflict::ConflictTable;
use crate::session::recording_session::{SessionPlan, SessionSettings};
use crate::session::registry::{SessionRegistry, Toggled};
use crate::storage::naming::allocate_output_path;
use crate::traits::capture_backend::CaptureBackend;
use crate::traits::session_observer::SessionObserver;

/// A logical action from the command-binding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderAction {
    Toggle(RecordingType),
    StopAll,
    ReportStatus,
    OpenOutputFolder,
}

impl RecorderAction {
    pub const ALL: [RecorderAction; 8] = [
        Self::Toggle(RecordingType::FocusedProcess),
        Self::Toggle(RecordingType::System),
        Self::Toggle(RecordingType::Microphone),
        Self::Toggle(RecordingType::MixProcessMic),
        Self::Toggle(RecordingType::MixSystemMic),
        Self::StopAll,
        Self::ReportStatus,
        Self::OpenOutputFolder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Toggle(RecordingType::FocusedProcess) => "toggleFocusedProcess",
            Self::Toggle(RecordingType::System) => "toggleSystem",
            Self::Toggle(RecordingType::Microphone) => "toggleMicrophone",
            Self::Toggle(RecordingType::MixProcessMic) => "toggleMixProcessMic",
            Self::Toggle(RecordingType::MixSystemMic) => "toggleMixSystemMic",
            Self::StopAll => "stopAll",
            Self::ReportStatus => "reportStatus",
            Self::OpenOutputFolder => "openOutputFolder",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.name() == name)
    }
}

/// What `dispatch` did.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Toggled(ToggleResult),
    Stopped(Vec<StopReport>),
    Status(Vec<SessionStatus>),
    /// The directory to show; presenting it is up to the host.
    OutputFolder(PathBuf),
}

enum Runtime {
    Uninitialized,
    Running(Arc<SessionRegistry>),
    ShutDown,
}

/// Toggle-driven recorder: the entry point for hosts.
///
/// Owns the capture backend and, from the first call that needs it, the
/// session registry. `shutdown` (or dropping the recorder) stops every
/// session and shuts the backend down.
pub struct Recorder {
    config: RecorderConfig,
    output_dir: PathBuf,
    backend: Arc<dyn CaptureBackend>,
    observer: Option<Arc<dyn SessionObserver>>,
    runtime: Mutex<Runtime>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, backend: Arc<dyn CaptureBackend>) -> Result<Self, CaptureError> {
        config.validate()?;
        let output_dir = config.resolve_output_directory()?;
        log::info!(
            "Recorder using {} backend, writing to {}",
            backend.name(),
            output_dir.display()
        );
        Ok(Self {
            config,
            output_dir,
            backend,
            observer: None,
            runtime: Mutex::new(Runtime::Uninitialized),
        })
    }

    /// Receive session lifecycle callbacks. Must be set before the first recording.
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    /// Start `recording_type` if idle, otherwise stop and finalize it.
    ///
    /// A stop that ends in failure returns the recorded cause.
    pub fn toggle(&self, recording_type: RecordingType) -> Result<ToggleResult, CaptureError> {
        let registry = self.registry()?;
        let toggled = registry.toggle(
            recording_type,
            || self.plan(recording_type),
            self.backend.as_ref(),
            self.config.stop_grace(),
        )?;
        match toggled {
            Toggled::Started(session) => Ok(ToggleResult::Started {
                recording_type,
                output_path: session.output_path().to_path_buf(),
            }),
            Toggled::Stopped(StopOutcome::Finalized(result)) => Ok(ToggleResult::Stopped(result)),
            Toggled::Stopped(StopOutcome::Failed(failure)) => Err(failure.cause),
            // The session ended on its own right before the stop; the
            // caller asked for a change, so start a fresh one.
            Toggled::Stopped(StopOutcome::NotActive) => self.start(recording_type).map(|output_path| {
                ToggleResult::Started {
                    recording_type,
                    output_path,
                }
            }),
        }
    }

    /// Start `recording_type`; returns the output path.
    pub fn start(&self, recording_type: RecordingType) -> Result<PathBuf, CaptureError> {
        let registry = self.registry()?;
        let plan = self.plan(recording_type)?;
        let session = registry.start(plan, self.backend.as_ref())?;
        Ok(session.output_path().to_path_buf())
    }

    /// Stop `recording_type`. `NotActive` if it is not running.
    pub fn stop(&self, recording_type: RecordingType) -> StopOutcome {
        match self.running_registry() {
            Some(registry) => registry.stop(recording_type, StopReason::User, self.config.stop_grace()),
            None => StopOutcome::NotActive,
        }
    }

    /// Stop every running session, collecting each result.
    pub fn stop_all(&self) -> Vec<StopReport> {
        match self.running_registry() {
            Some(registry) => registry.stop_all(StopReason::StopAll, self.config.stop_grace()),
            None => Vec::new(),
        }
    }

    pub fn status(&self) -> Vec<SessionStatus> {
        self.running_registry()
            .map(|registry| registry.status())
            .unwrap_or_default()
    }

    pub fn is_recording(&self, recording_type: RecordingType) -> bool {
        self.running_registry()
            .is_some_and(|registry| registry.is_active(recording_type))
    }

    pub fn active_count(&self) -> usize {
        self.running_registry()
            .map_or(0, |registry| registry.active_count())
    }

    /// Change the volume of one source of a running recording, in percent (0-200).
    pub fn set_volume(
        &self,
        recording_type: RecordingType,
        kind: SourceKind,
        percent: u16,
    ) -> Result<(), CaptureError> {
        match self.running_registry() {
            Some(registry) => registry.set_volume(recording_type, kind, percent),
            None => Err(CaptureError::ConfigurationFailed(format!("{} is not recording", recording_type))),
        }
    }

    /// Input devices usable for microphone recording.
    pub fn input_devices(&self) -> Result<Vec<InputDevice>, CaptureError> {
        self.registry()?;
        self.backend.input_devices()
    }

    pub fn dispatch(&self, action: RecorderAction) -> Result<ActionOutcome, CaptureError> {
        log::debug!("Dispatching {}", action.name());
        match action {
            RecorderAction::Toggle(recording_type) => self.toggle(recording_type).map(ActionOutcome::Toggled),
            RecorderAction::StopAll => Ok(ActionOutcome::Stopped(self.stop_all())),
            RecorderAction::ReportStatus => Ok(ActionOutcome::Status(self.status())),
            RecorderAction::OpenOutputFolder => Ok(ActionOutcome::OutputFolder(self.output_dir.clone())),
        }
    }

    /// Stop every session and shut the backend down. Idempotent.
    ///
    /// Every later start fails with `ShutDown`.
    pub fn shutdown(&self) -> Vec<StopReport> {
        let previous = std::mem::replace(&mut *self.runtime.lock(), Runtime::ShutDown);
        match previous {
            Runtime::Running(registry) => {
                let reports = registry.shutdown(self.config.stop_grace());
                self.backend.shutdown();
                log::info!("Recorder shut down, {} session(s) stopped", reports.len());
                reports
            }
            Runtime::Uninitialized | Runtime::ShutDown => Vec::new(),
        }
    }

    /// The registry, initializing the backend on first use.
    fn registry(&self) -> Result<Arc<SessionRegistry>, CaptureError> {
        let mut runtime = self.runtime.lock();
        match &*runtime {
            Runtime::Running(registry) => Ok(Arc::clone(registry)),
            Runtime::ShutDown => Err(CaptureError::ShutDown),
            Runtime::Uninitialized => {
                self.backend.initialize()?;
                let registry = Arc::new(SessionRegistry::new(
                    ConflictTable::from_policy(self.config.conflict_policy),
                    self.observer.clone(),
                ));
                log::debug!("{} backend initialized", self.backend.name());
                *runtime = Runtime::Running(Arc::clone(&registry));
                Ok(registry)
            }
        }
    }

    fn running_registry(&self) -> Option<Arc<SessionRegistry>> {
        match &*self.runtime.lock() {
            Runtime::Running(registry) => Some(Arc::clone(registry)),
            Runtime::Uninitialized | Runtime::ShutDown => None,
        }
    }

    fn plan(&self, recording_type: RecordingType) -> Result<SessionPlan, CaptureError> {
        let process = if recording_type.needs_focused_process() {
            let target = self
                .backend
                .focused_process()
                .ok_or_else(|| CaptureError::DeviceUnavailable("no focused process to record".into()))?;
            log::info!("Focused process: {} ({})", target.name, target.pid);
            Some(target)
        } else {
            None
        };

        let mut sources = Vec::with_capacity(recording_type.sources().len());
        for &kind in recording_type.sources() {
            sources.push(match (kind, &process) {
                (SourceKind::Process, Some(target)) => SourceSpec::Process { target: target.clone() },
                (SourceKind::Process, None) => {
                    return Err(CaptureError::DeviceUnavailable("no focused process to record".into()))
                }
                (SourceKind::System, _) => SourceSpec::System,
                (SourceKind::Microphone, _) => SourceSpec::Microphone {
                    device_id: self.config.microphone_device_id.clone(),
                },
            });
        }

        let started_at = Local::now();
        let output_path = allocate_output_path(
            &self.output_dir,
            recording_type,
            &started_at,
            self.config.output_format.extension(),
        );
        Ok(SessionPlan {
            recording_type,
            sources,
            process,
            output_path,
            started_at,
            settings: SessionSettings::from_config(&self.config, recording_type)?,
        })
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
