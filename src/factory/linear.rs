use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::models::TrackerItem;
use super::tracker::{PagePosition, PullRequestRef, TrackerClient, TrackerPage};

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const TEAM_ISSUES_QUERY: &str = r#"query($teamId: String!, $first: Int!, $after: String) {
  team(id: $teamId) {
    issues(
      filter: { state: { type: { nin: ["completed", "canceled"] } } },
      first: $first,
      after: $after
    ) {
      pageInfo { hasNextPage endCursor }
      nodes {
        identifier
        url
        title
        description
        priorityLabel
        labels { nodes { name } }
        state { type }
        createdAt
      }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<TeamData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TeamData {
    team: Option<Team>,
}

#[derive(Debug, Deserialize)]
struct Team {
    issues: IssueConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<LinearIssue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearIssue {
    identifier: String,
    url: String,
    title: String,
    description: Option<String>,
    priority_label: Option<String>,
    labels: Option<LabelConnection>,
    state: Option<StateRef>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct LabelConnection {
    #[serde(default)]
    nodes: Vec<LabelNode>,
}

#[derive(Debug, Deserialize)]
struct LabelNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StateRef {
    #[serde(rename = "type")]
    kind: String,
}

impl LinearIssue {
    fn into_item(self) -> TrackerItem {
        let closed = self
            .state
            .as_ref()
            .is_some_and(|s| s.kind == "completed" || s.kind == "canceled");
        TrackerItem {
            source_id: self.identifier,
            source_url: self.url,
            title: self.title,
            description: self.description.unwrap_or_default(),
            labels: self
                .labels
                .map(|l| l.nodes.into_iter().map(|n| n.name).collect())
                .unwrap_or_default(),
            priority: self.priority_label.unwrap_or_else(|| "No priority".to_string()),
            status: if closed { "closed" } else { "open" }.to_string(),
            created_at: self.created_at,
        }
    }
}

/// Linear GraphQL client. `repo_ref` is the team id.
pub struct LinearClient {
    http: reqwest::Client,
    token: Option<String>,
    api_url: String,
}

impl LinearClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("scout")
            .build()
            .context("Failed to build Linear HTTP client")?;
        Ok(Self {
            http,
            token,
            api_url: LINEAR_API_URL.to_string(),
        })
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

#[async_trait]
impl TrackerClient for LinearClient {
    async fn list_open_items(
        &self,
        repo_ref: &str,
        page_size: u32,
        position: &PagePosition,
    ) -> Result<TrackerPage> {
        let token = self
            .token
            .as_deref()
            .context("Linear token not configured (set LINEAR_TOKEN)")?;
        let after = match position {
            PagePosition::Cursor(c) => c.clone(),
            PagePosition::Page(_) => anyhow::bail!("Linear issues are cursor-paginated"),
        };
        let body = json!({
            "query": TEAM_ISSUES_QUERY,
            "variables": {
                "teamId": repo_ref,
                "first": page_size.clamp(1, 100),
                "after": after,
            }
        });

        // Linear takes the raw API key, not a Bearer token.
        let resp = self
            .http
            .post(&self.api_url)
            .header("Authorization", token)
            .json(&body)
            .send()
            .await
            .context("Failed to send Linear request")?;
        let status = resp.status();
        let text = resp.text().await.context("Failed to read Linear response body")?;
        let page = parse_issues_response(status.as_u16(), &text, after)?;
        debug!(team = repo_ref, count = page.items.len(), has_next = page.has_next, "fetched Linear issue page");
        Ok(page)
    }

    async fn list_open_pull_requests(&self, _repo_ref: &str) -> Result<Vec<PullRequestRef>> {
        anyhow::bail!("Linear has no pull requests; detect them on the linked GitHub remote")
    }
}

fn parse_issues_response(status: u16, body: &str, after: Option<String>) -> Result<TrackerPage> {
    let parsed: Option<GraphQlResponse> = serde_json::from_str(body).ok();
    let messages = |resp: &GraphQlResponse| {
        resp.errors
            .iter()
            .map(|e| e.message.as_deref().unwrap_or("Unknown error"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    if status >= 400 {
        let detail = parsed
            .as_ref()
            .filter(|r| !r.errors.is_empty())
            .map(messages)
            .unwrap_or_else(|| format!("HTTP {}", status));
        anyhow::bail!("Linear API error: {}", detail);
    }
    let resp = parsed.context("Failed to parse Linear response")?;
    let error_text = messages(&resp);
    let Some(data) = resp.data else {
        anyhow::bail!("Linear API error: {}", error_text);
    };
    if !error_text.is_empty() {
        warn!(errors = %error_text, "Linear returned partial data");
    }
    let Some(team) = data.team else {
        return Ok(TrackerPage {
            items: Vec::new(),
            has_next: false,
            next_position: PagePosition::Cursor(after),
        });
    };

    let PageInfo {
        has_next_page,
        end_cursor,
    } = team.issues.page_info;
    Ok(TrackerPage {
        items: team
            .issues
            .nodes
            .into_iter()
            .map(LinearIssue::into_item)
            .collect(),
        has_next: has_next_page,
        next_position: PagePosition::Cursor(end_cursor.or(after)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{"data": {"team": {"issues": {
        "pageInfo": {"hasNextPage": true, "endCursor": "c2"},
        "nodes": [{
            "identifier": "ENG-12", "url": "https://linear.app/acme/issue/ENG-12",
            "title": "Flaky export", "description": null, "priorityLabel": "High",
            "labels": {"nodes": [{"name": "bug"}]},
            "state": {"type": "started"}, "createdAt": "2026-02-01T00:00:00.000Z"
        }]
    }}}}"#;

    #[test]
    fn test_parse_page_maps_fields_and_cursor() -> Result<()> {
        let page = parse_issues_response(200, PAGE, Some("c1".into()))?;
        assert!(page.has_next);
        assert_eq!(page.next_position, PagePosition::Cursor(Some("c2".into())));
        let item = &page.items[0];
        assert_eq!(item.source_id, "ENG-12");
        assert_eq!(item.priority, "High");
        assert_eq!(item.labels, vec!["bug"]);
        assert_eq!(item.status, "open");
        assert_eq!(item.description, "");
        Ok(())
    }

    #[test]
    fn test_last_page_keeps_previous_cursor_when_end_cursor_missing() -> Result<()> {
        let body = r#"{"data": {"team": {"issues": {
            "pageInfo": {"hasNextPage": false, "endCursor": null}, "nodes": []}}}}"#;
        let page = parse_issues_response(200, body, Some("c9".into()))?;
        assert!(!page.has_next);
        assert_eq!(page.next_position, PagePosition::Cursor(Some("c9".into())));
        Ok(())
    }

    #[test]
    fn test_errors_without_data_fail() {
        let body = r#"{"errors": [{"message": "Entity not found"}]}"#;
        let err = parse_issues_response(200, body, None).unwrap_err();
        assert!(err.to_string().contains("Entity not found"));

        let err = parse_issues_response(401, "unauthorized", None).unwrap_err();
        assert!(err.to_string().contains("HTTP 401"));
    }

    #[test]
    fn test_partial_errors_with_data_still_return_items() -> Result<()> {
        let body = PAGE.replacen('{', r#"{"errors": [{"message": "label lookup failed"}], "#, 1);
        let page = parse_issues_response(200, &body, None)?;
        assert_eq!(page.items.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_requests_are_not_a_linear_concept() -> Result<()> {
        let client = LinearClient::new(Some("lin_api_x".into()), Duration::from_secs(1))?;
        assert!(client.list_open_pull_requests("team-1").await.is_err());
        Ok(())
    }
}
