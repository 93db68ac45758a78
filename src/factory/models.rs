use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Github,
    Linear,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Linear => "linear",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "linear" => Ok(Self::Linear),
            _ => Err(format!("Invalid source: {}", s)),
        }
    }
}

/// Locally computed judgment of whether an issue is automatable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Pending,
    AgenticPrCapable,
    TooComplex,
}

impl Assessment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AgenticPrCapable => "agentic_pr_capable",
            Self::TooComplex => "too_complex",
        }
    }
}

impl std::fmt::Display for Assessment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Assessment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "agentic_pr_capable" => Ok(Self::AgenticPrCapable),
            "too_complex" => Ok(Self::TooComplex),
            _ => Err(format!("Invalid assessment: {}", s)),
        }
    }
}

/// Progress of an automated fix attempt, independent of the tracker's
/// open/closed status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    None,
    InProgress,
    BranchPushed,
    PrCreated,
    NeedsReview,
    Failed,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::InProgress => "in_progress",
            Self::BranchPushed => "branch_pushed",
            Self::PrCreated => "pr_created",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
        }
    }
}

impl PrStatus {
    /// Resulting status for an agent's terminal report.
    ///
    /// | reported     | auto_create_pr | pr_url | result        |
    /// |--------------|----------------|--------|---------------|
    /// | complete     | true           | yes    | pr_created    |
    /// | complete     | true           | no     | needs_review  |
    /// | complete     | false          | -      | branch_pushed |
    /// | failed       | -              | -      | failed        |
    /// | needs_review | -              | -      | needs_review  |
    pub fn from_report(reported: ReportedStatus, auto_create_pr: bool, has_pr_url: bool) -> Self {
        match reported {
            ReportedStatus::Complete if !auto_create_pr => Self::BranchPushed,
            ReportedStatus::Complete if has_pr_url => Self::PrCreated,
            ReportedStatus::Complete => Self::NeedsReview,
            ReportedStatus::Failed => Self::Failed,
            ReportedStatus::NeedsReview => Self::NeedsReview,
        }
    }
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "in_progress" => Ok(Self::InProgress),
            "branch_pushed" => Ok(Self::BranchPushed),
            "pr_created" => Ok(Self::PrCreated),
            "needs_review" => Ok(Self::NeedsReview),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid pr_status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Pending,
    Complete,
    Failed,
    NeedsReview,
    Cancelled,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid callback status: {}", s)),
        }
    }
}

/// Terminal status an agent may report. Narrower than `CallbackStatus`:
/// an agent can never report `pending` or `cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Complete,
    Failed,
    NeedsReview,
}

impl ReportedStatus {
    pub fn as_callback_status(&self) -> CallbackStatus {
        match self {
            Self::Complete => CallbackStatus::Complete,
            Self::Failed => CallbackStatus::Failed,
            Self::NeedsReview => CallbackStatus::NeedsReview,
        }
    }
}

impl FromStr for ReportedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            _ => Err(format!(
                "Invalid status: {} (expected complete, failed or needs_review)",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub source: Source,
    /// `owner/repo` for GitHub, the team id for Linear.
    pub source_id: String,
    pub name: String,
    pub local_path: Option<String>,
    pub default_branch: String,
    pub default_mode: String,
    pub auto_create_pr: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRepo {
    pub source: Source,
    pub source_id: String,
    pub name: String,
    pub local_path: Option<String>,
    pub default_branch: Option<String>,
    pub default_mode: Option<String>,
    #[serde(default)]
    pub auto_create_pr: bool,
}

/// Operator-editable repo settings. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoUpdate {
    pub local_path: Option<String>,
    pub default_branch: Option<String>,
    pub default_mode: Option<String>,
    pub auto_create_pr: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub repo_id: i64,
    pub source: Source,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: String,
    pub status: String,
    pub summary: Option<String>,
    pub assessment: Assessment,
    pub pr_status: PrStatus,
    pub pr_url: Option<String>,
    pub pr_branch: Option<String>,
    pub analysis_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub analyzed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callback {
    pub id: i64,
    pub callback_id: String,
    pub issue_id: i64,
    pub status: CallbackStatus,
    pub worktree_path: Option<String>,
    pub repo_root_path: Option<String>,
    pub branch_name: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Callback row together with the owning repo's `auto_create_pr` flag,
/// which the gateway needs to resolve the resulting `pr_status`.
#[derive(Debug, Clone)]
pub struct CallbackRecord {
    pub callback: Callback,
    pub auto_create_pr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoSyncState {
    pub repo_id: i64,
    pub next_page: u32,
    pub next_cursor: Option<String>,
    pub page_size: u32,
    pub has_more: bool,
    pub last_fetch_count: u32,
    pub last_fetch_at: Option<String>,
}

impl RepoSyncState {
    pub fn initial(repo_id: i64) -> Self {
        Self {
            repo_id,
            next_page: 1,
            next_cursor: None,
            page_size: 50,
            has_more: true,
            last_fetch_count: 0,
            last_fetch_at: None,
        }
    }

    /// Same place in the tracker's result set, ignoring fetch bookkeeping.
    pub fn same_position(&self, other: &RepoSyncState) -> bool {
        self.next_page == other.next_page
            && self.next_cursor == other.next_cursor
            && self.has_more == other.has_more
    }
}

/// Tracker fields written by the sync engine. Locally owned fields
/// (assessment, pr_status, pr_url, pr_branch) are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerItem {
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct UpsertCounts {
    pub new: usize,
    pub updated: usize,
}

/// Outcome of storing one fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPage {
    pub counts: UpsertCounts,
    /// False when a concurrent sync moved the cursor first.
    pub cursor_advanced: bool,
    /// The cursor as stored after the write.
    pub cursor: RepoSyncState,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuePage {
    pub issues: Vec<Issue>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pr_status_round_trips_through_str() {
        for status in [
            PrStatus::None,
            PrStatus::InProgress,
            PrStatus::BranchPushed,
            PrStatus::PrCreated,
            PrStatus::NeedsReview,
            PrStatus::Failed,
        ] {
            assert_eq!(PrStatus::from_str(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn test_pr_status_from_report_table() {
        use ReportedStatus::*;
        let cases = [
            (Complete, true, true, PrStatus::PrCreated),
            (Complete, true, false, PrStatus::NeedsReview),
            (Complete, false, true, PrStatus::BranchPushed),
            (Complete, false, false, PrStatus::BranchPushed),
            (Failed, true, true, PrStatus::Failed),
            (Failed, false, false, PrStatus::Failed),
            (NeedsReview, true, true, PrStatus::NeedsReview),
            (NeedsReview, false, false, PrStatus::NeedsReview),
        ];
        for (reported, auto_pr, has_url, expected) in cases {
            assert_eq!(
                PrStatus::from_report(reported, auto_pr, has_url),
                expected,
                "{:?} auto_pr={} has_url={}",
                reported,
                auto_pr,
                has_url
            );
        }
    }

    #[test]
    fn test_reported_status_rejects_non_terminal_values() {
        assert!(ReportedStatus::from_str("pending").is_err());
        assert!(ReportedStatus::from_str("cancelled").is_err());
        assert_eq!(
            ReportedStatus::from_str("needs_review"),
            Ok(ReportedStatus::NeedsReview)
        );
    }

    #[test]
    fn test_assessment_serde_uses_snake_case() {
        let json = serde_json::to_string(&Assessment::AgenticPrCapable).unwrap();
        assert_eq!(json, "\"agentic_pr_capable\"");
        let parsed: Assessment = serde_json::from_str("\"too_complex\"").unwrap();
        assert_eq!(parsed, Assessment::TooComplex);
    }

    #[test]
    fn test_initial_sync_state() {
        let state = RepoSyncState::initial(7);
        assert_eq!(state.next_page, 1);
        assert_eq!(state.page_size, 50);
        assert!(state.has_more);
        assert!(state.next_cursor.is_none());
    }
}
