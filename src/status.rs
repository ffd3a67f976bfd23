use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::Job;
use crate::launcher::LaunchHandle;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub user: String,
    pub session_expires_at: DateTime<Utc>,
    pub installed_games: usize,
    pub installed_protons: usize,
    pub running_jobs: Vec<Job>,
    pub active_launches: Vec<LaunchHandle>,
}

impl StatusReport {
    pub fn is_idle(&self) -> bool {
        self.running_jobs.is_empty() && self.active_launches.is_empty()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session: active for {} (expires {})",
            self.user,
            self.session_expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f, "Installed games: {}", self.installed_games)?;
        writeln!(f, "Installed Protons: {}", self.installed_protons)?;

        if self.running_jobs.is_empty() {
            writeln!(f, "Running jobs: none")?;
        } else {
            writeln!(f, "Running jobs: {}", self.running_jobs.len())?;
            for job in &self.running_jobs {
                writeln!(
                    f,
                    "  - {} {} ({:.0}%)",
                    job.kind,
                    job.key,
                    job.progress * 100.0
                )?;
            }
        }

        if self.active_launches.is_empty() {
            write!(f, "Running games: none")
        } else {
            write!(f, "Running games: {}", self.active_launches.len())?;
            for h in &self.active_launches {
                write!(f, "\n  - {} (pid {})", h.app_id, h.pid)?;
            }
            Ok(())
        }
    }
}
