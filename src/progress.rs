use serde::Serialize;

/// Progress detail of a long-running multi-step job.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct JobProgress {
    pub steps_total: u32,
    pub step: u32, // 1-based
    pub step_name: String,
    pub step_progress: f64, // 0.0..=1.0

    // Optional details (used by download/extract phases)
    pub detail: Option<String>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

impl JobProgress {
    pub fn step(step: u32, steps_total: u32, step_name: &str) -> Self {
        Self {
            steps_total,
            step,
            step_name: step_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, step_progress: f64) -> Self {
        self.step_progress = step_progress.clamp(0.0, 1.0);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.downloaded_bytes = Some(downloaded);
        self.total_bytes = total;
        if let Some(t) = total.filter(|t| *t > 0) {
            self.step_progress = (downloaded as f64 / t as f64).clamp(0.0, 1.0);
        }
        self
    }

    /// Overall completion as a fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.steps_total == 0 {
            return 0.0;
        }
        overall_from_step(self.step, self.step_progress, self.steps_total) / 100.0
    }
}

/// Overall percent (`0.0..=100.0`) given the current step and its own progress.
pub fn overall_from_step(step: u32, step_progress: f64, steps_total: u32) -> f64 {
    let s = step.max(1).min(steps_total) as f64;
    let sp = step_progress.clamp(0.0, 1.0);
    (((s - 1.0) + sp) / (steps_total as f64)) * 100.0
}

/// Pulls a percentage out of a line like `= Progress: 42.17% (1024/4096), Running for 00:00:12`.
pub fn parse_percent(line: &str) -> Option<f64> {
    let idx = line.find("Progress:")?;
    let rest = line[idx + "Progress:".len()..].trim_start();
    let end = rest.find('%')?;
    let pct: f64 = rest[..end].trim().parse().ok()?;
    Some((pct / 100.0).clamp(0.0, 1.0))
}
