//! Progress reporting for image assembly.

use serde::{Deserialize, Serialize};

use crate::pipeline::AssemblyStep;

/// One progress update emitted while assembling.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AssemblyProgress {
    pub percentage: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<AssemblyStep>,
}

impl AssemblyProgress {
    pub fn new(percentage: u32, message: String) -> Self {
        Self {
            percentage,
            message,
            step: None,
        }
    }
}

/// Progress reporter for assembly steps.
pub trait ProgressReporter {
    fn emit(&self, percentage: u32, message: String);

    /// Emit progress tagged with the step it belongs to.
    fn emit_step(&self, percentage: u32, message: String, _step: AssemblyStep) {
        self.emit(percentage, message);
    }
}

/// Reporter that forwards progress to the log.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[assembler] [{:>3}%] {}", percentage, message);
    }
}

/// In-memory reporter for asserting on emitted progress in tests.
#[derive(Default)]
pub struct RecordingProgressReporter {
    updates: std::sync::Mutex<Vec<AssemblyProgress>>,
}

impl RecordingProgressReporter {
    pub fn updates(&self) -> Vec<AssemblyProgress> {
        self.updates
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(AssemblyProgress::new(percentage, message));
        }
    }

    fn emit_step(&self, percentage: u32, message: String, step: AssemblyStep) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(AssemblyProgress {
                percentage,
                message,
                step: Some(step),
            });
        }
    }
}
