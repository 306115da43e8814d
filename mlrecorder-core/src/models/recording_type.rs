use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of live audio source behind a capture endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Loopback of a single process (and optionally its child processes).
    Process,
    /// Loopback of the full system render mix.
    System,
    /// An input device.
    Microphone,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::System => "system",
            Self::Microphone => "microphone",
        }
    }
}

/// The fixed set of logical recordings a caller can toggle.
///
/// Each type owns one session slot; at most one session per type is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingType {
    FocusedProcess,
    System,
    Microphone,
    MixProcessMic,
    MixSystemMic,
}

impl RecordingType {
    pub const ALL: [RecordingType; 5] = [
        Self::FocusedProcess,
        Self::System,
        Self::Microphone,
        Self::MixProcessMic,
        Self::MixSystemMic,
    ];

    /// Sources opened for this type, primary first.
    ///
    /// Mixed types list the loopback source first and the microphone second.
    pub fn sources(self) -> &'static [SourceKind] {
        match self {
            Self::FocusedProcess => &[SourceKind::Process],
            Self::System => &[SourceKind::System],
            Self::Microphone => &[SourceKind::Microphone],
            Self::MixProcessMic => &[SourceKind::Process, SourceKind::Microphone],
            Self::MixSystemMic => &[SourceKind::System, SourceKind::Microphone],
        }
    }

    pub fn is_mixed(self) -> bool {
        self.sources().len() > 1
    }

    pub fn uses(self, kind: SourceKind) -> bool {
        self.sources().contains(&kind)
    }

    pub fn needs_focused_process(self) -> bool {
        self.uses(SourceKind::Process)
    }

    /// Stable label used in file names and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::FocusedProcess => "process",
            Self::System => "system",
            Self::Microphone => "microphone",
            Self::MixProcessMic => "mix-process-mic",
            Self::MixSystemMic => "mix-system-mic",
        }
    }
}

impl fmt::Display for RecordingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_types_have_two_sources() {
        for t in RecordingType::ALL {
            assert_eq!(t.is_mixed(), t.sources().len() == 2, "{t}");
        }
        assert_eq!(
            RecordingType::MixSystemMic.sources(),
            &[SourceKind::System, SourceKind::Microphone]
        );
    }

    #[test]
    fn labels_are_unique() {
        let mut labels: Vec<_> = RecordingType::ALL.iter().map(|t| t.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), RecordingType::ALL.len());
    }

    #[test]
    fn focused_process_requirement() {
        assert!(RecordingType::FocusedProcess.needs_focused_process());
        assert!(RecordingType::MixProcessMic.needs_focused_process());
        assert!(!RecordingType::MixSystemMic.needs_focused_process());
    }
}
