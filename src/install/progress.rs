use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Initializing,
    Resuming,
    Downloading,
    Installing,
    MovingToInstall,
    BuildVerification,
    PrerequisitesInstall,
    CleanUp,
}

impl InstallStage {
    pub const ALL: [InstallStage; 8] = [
        InstallStage::Initializing,
        InstallStage::Resuming,
        InstallStage::Downloading,
        InstallStage::Installing,
        InstallStage::MovingToInstall,
        InstallStage::BuildVerification,
        InstallStage::PrerequisitesInstall,
        InstallStage::CleanUp,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Default share of the overall progress bar
    fn default_weight(self) -> f32 {
        match self {
            InstallStage::Initializing => 0.01,
            InstallStage::Resuming => 0.05,
            InstallStage::BuildVerification => 0.1,
            InstallStage::CleanUp => 0.02,
            _ => 0.0,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            InstallStage::Initializing => "Initializing",
            InstallStage::Resuming => "Resuming",
            InstallStage::Downloading => "Downloading",
            InstallStage::Installing => "Installing",
            InstallStage::MovingToInstall => "Moving files",
            InstallStage::BuildVerification => "Verifying",
            InstallStage::PrerequisitesInstall => "Installing prerequisites",
            InstallStage::CleanUp => "Cleaning up",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StageState {
    weight: f32,
    progress: f32,
}

/// Weighted per-stage progress folded into a single 0..1 value
#[derive(Debug)]
pub struct ProgressTracker {
    stages: Mutex<[StageState; 8]>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            stages: Mutex::new(Self::initial_stages()),
        }
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn initial_stages() -> [StageState; 8] {
        InstallStage::ALL.map(|stage| StageState {
            weight: stage.default_weight(),
            progress: 0.0,
        })
    }

    pub fn set_stage_weight(&self, stage: InstallStage, weight: f32) {
        let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        self.stages.lock()[stage.index()].weight = weight;
    }

    pub fn stage_weight(&self, stage: InstallStage) -> f32 {
        self.stages.lock()[stage.index()].weight
    }

    pub fn set_stage_progress(&self, stage: InstallStage, progress: f32) {
        let progress = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 };
        self.stages.lock()[stage.index()].progress = progress;
    }

    pub fn stage_progress(&self, stage: InstallStage) -> f32 {
        self.stages.lock()[stage.index()].progress
    }

    /// Overall progress in 0..=1
    pub fn progress(&self) -> f32 {
        let stages = self.stages.lock();
        let total_weight: f32 = stages.iter().map(|s| s.weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let done: f32 = stages.iter().map(|s| s.weight * s.progress).sum();
        (done / total_weight).clamp(0.0, 1.0)
    }

    /// First weighted stage that is not finished yet
    pub fn current_stage(&self) -> Option<InstallStage> {
        let stages = self.stages.lock();
        InstallStage::ALL
            .iter()
            .copied()
            .find(|stage| {
                let state = stages[stage.index()];
                state.weight > 0.0 && state.progress < 1.0
            })
    }
}
