use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

use crate::models::RepositoryDescriptor;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Skipped,
    Failed,
    /// Not completed because the run was cancelled or never dispatched.
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Statuses that do not count against the exit code.
    pub fn is_ok(&self) -> bool { matches!(self, Self::Success | Self::Skipped) }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Final state of one repository within a run. Exactly one per distinct
/// discovered identity.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Discovery order, used to sort the final report deterministically.
    #[serde(skip)]
    pub index: usize,
    pub repository: RepositoryDescriptor,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Totals {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub aborted: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished: OffsetDateTime,
    /// True when the run was cancelled or cut short by a fatal error.
    pub aborted: bool,
    pub totals: Totals,
    pub outcomes: Vec<RunOutcome>,
}

impl RunReport {
    pub fn new(
        started: OffsetDateTime,
        finished: OffsetDateTime,
        aborted: bool,
        mut outcomes: Vec<RunOutcome>,
    ) -> Self {
        outcomes.sort_by_key(|o| o.index);
        let mut totals = Totals::default();
        for outcome in &outcomes {
            match outcome.status {
                RunStatus::Success => totals.success += 1,
                RunStatus::Skipped => totals.skipped += 1,
                RunStatus::Failed => totals.failed += 1,
                RunStatus::Aborted => totals.aborted += 1,
            }
        }
        Self { started, finished, aborted, totals, outcomes }
    }

    /// 0 = every repository Success/Skipped, 1 = partial failure,
    /// 2 = the run itself did not complete.
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            2
        } else if self.outcomes.iter().all(|o| o.status.is_ok()) {
            0
        } else {
            1
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for outcome in &self.outcomes {
            out.push_str(&format!(
                "{:<8} {} ({}ms",
                outcome.status,
                outcome.repository.id,
                outcome.duration_ms
            ));
            if outcome.attempts > 1 {
                out.push_str(&format!(", {} attempts", outcome.attempts));
            }
            out.push(')');
            if let Some(reason) = &outcome.reason {
                out.push_str(": ");
                out.push_str(reason);
            }
            out.push('\n');
        }
        let Totals { success, skipped, failed, aborted } = self.totals;
        let elapsed = self.finished - self.started;
        out.push_str(&format!(
            "{} succeeded, {} skipped, {} failed, {} aborted in {:.1}s\n",
            success,
            skipped,
            failed,
            aborted,
            elapsed.as_seconds_f64()
        ));
        if self.aborted {
            out.push_str("run aborted before completion\n");
        }
        out
    }
}
