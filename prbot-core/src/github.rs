use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::forge::{CommitStatus, ForgeClient, ForgeComment, IssueSnapshot, IssueState, PullInfo};
use crate::state_machine::{CommentId, CommitSha, IssueId, Milestone, StatusState};

const PER_PAGE: usize = 100;
/// GitHub rejects status descriptions longer than this.
const MAX_STATUS_DESCRIPTION: usize = 140;

/// `ForgeClient` backed by the GitHub REST API and a personal access token.
///
/// Reactions already left by the bot are not fetched; GitHub treats a
/// repeated reaction as a no-op.
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MilestoneResponse {
    number: u64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    user: User,
    #[serde(default)]
    title: String,
    state: String,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    assignees: Vec<User>,
    milestone: Option<MilestoneResponse>,
    /// Present only on pull requests.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: User,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    head: GitRef,
    base: GitRef,
    #[serde(default)]
    commits: u32,
}

#[derive(Debug, Deserialize)]
struct TreeRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitCommitResponse {
    tree: TreeRef,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    context: String,
    state: String,
    target_url: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusResponse {
    #[serde(default)]
    statuses: Vec<StatusResponse>,
}

#[derive(Debug, Serialize)]
struct CreateStatusRequest<'a> {
    state: &'a str,
    context: &'a str,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
}

fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_STATUS_DESCRIPTION).collect()
}

fn to_comment(comment: CommentResponse) -> ForgeComment {
    ForgeComment {
        id: CommentId(comment.id),
        author: comment.user.login,
        body: comment.body.unwrap_or_default(),
        created_at: comment.created_at,
        bot_reactions: Vec::new(),
    }
}

/// Build a snapshot from the fetched pieces. Unknown status states are
/// dropped.
fn to_snapshot(
    issue: &IssueId,
    response: IssueResponse,
    comments: Vec<CommentResponse>,
    pull: Option<PullInfo>,
    statuses: Vec<StatusResponse>,
) -> IssueSnapshot {
    let mut snapshot = IssueSnapshot::new(issue.clone(), response.user.login);
    snapshot.title = response.title;
    snapshot.state = if response.state == "closed" {
        IssueState::Closed
    } else {
        IssueState::Open
    };
    snapshot.labels = response.labels.into_iter().map(|l| l.name).collect();
    snapshot.assignees = response.assignees.into_iter().map(|u| u.login).collect();
    snapshot.milestone = response.milestone.map(|m| Milestone {
        id: m.number,
        title: m.title,
    });
    snapshot.comments = comments.into_iter().map(to_comment).collect();
    if let Some(pull) = &pull {
        snapshot.statuses = statuses
            .into_iter()
            .filter_map(|s| {
                Some(CommitStatus {
                    sha: pull.head_sha.clone(),
                    context: s.context,
                    state: StatusState::parse(&s.state)?,
                    target_url: s.target_url,
                    description: s.description.unwrap_or_default(),
                })
            })
            .collect();
    }
    snapshot.pull = pull;
    snapshot
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("prbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn repo_url(&self, issue: &IssueId, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_url, issue.repo_owner, issue.repo_name, path
        )
    }

    fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send and turn non-success statuses into errors.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error ({}): {} - {}", what, status, error_text);
            return Err(anyhow!("GitHub API error ({}): {} - {}", what, status, error_text));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, what: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, url), what).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// GET every page of a list endpoint.
    async fn get_paged<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let separator = if url.contains('?') { '&' } else { '?' };
            let page_url = format!("{url}{separator}page={page}&per_page={PER_PAGE}");
            let items: Vec<T> = self.get_json(page_url, what).await?;
            let done = items.len() < PER_PAGE;
            all.extend(items);
            if done {
                return Ok(all);
            }
            page += 1;
        }
    }

    async fn get_pull(&self, issue: &IssueId) -> Result<PullInfo> {
        let pull: PullResponse = self
            .get_json(self.repo_url(issue, &format!("/pulls/{}", issue.number)), "get pull request")
            .await?;
        let head: GitCommitResponse = self
            .get_json(
                self.repo_url(issue, &format!("/git/commits/{}", pull.head.sha)),
                "get head commit",
            )
            .await?;
        Ok(PullInfo {
            head_sha: CommitSha(pull.head.sha),
            base_branch: pull.base.ref_name,
            commit_count: pull.commits,
            tree_sha: Some(head.tree.sha),
        })
    }
}

#[async_trait]
impl ForgeClient for GitHubClient {
    async fn get_issue(&self, issue: &IssueId) -> Result<IssueSnapshot> {
        info!("Fetching {}", issue);
        let response: IssueResponse = self
            .get_json(self.repo_url(issue, &format!("/issues/{}", issue.number)), "get issue")
            .await?;
        let comments: Vec<CommentResponse> = self
            .get_paged(
                &self.repo_url(issue, &format!("/issues/{}/comments", issue.number)),
                "list comments",
            )
            .await?;

        let (pull, statuses) = if response.pull_request.is_some() {
            let pull = self.get_pull(issue).await?;
            let path = format!("/commits/{}/status?per_page=100", pull.head_sha);
            let combined: CombinedStatusResponse = self
                .get_json(self.repo_url(issue, &path), "get combined status")
                .await?;
            (Some(pull), combined.statuses)
        } else {
            (None, Vec::new())
        };

        Ok(to_snapshot(issue, response, comments, pull, statuses))
    }

    async fn create_comment(&self, issue: &IssueId, body: &str) -> Result<CommentId> {
        let url = self.repo_url(issue, &format!("/issues/{}/comments", issue.number));
        let response = self
            .send(
                self.request(Method::POST, url).json(&json!({ "body": body })),
                "create comment",
            )
            .await?;
        let comment: CommentResponse = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Created comment {} on {}", comment.id, issue);
        Ok(CommentId(comment.id))
    }

    async fn edit_comment(&self, issue: &IssueId, comment_id: CommentId, body: &str) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/comments/{}", comment_id));
        self.send(
            self.request(Method::PATCH, url).json(&json!({ "body": body })),
            "edit comment",
        )
        .await?;
        Ok(())
    }

    async fn delete_comment(&self, issue: &IssueId, comment_id: CommentId) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/comments/{}", comment_id));
        self.send(self.request(Method::DELETE, url), "delete comment")
            .await?;
        Ok(())
    }

    async fn add_labels(&self, issue: &IssueId, labels: &[String]) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/{}/labels", issue.number));
        self.send(
            self.request(Method::POST, url).json(&json!({ "labels": labels })),
            "add labels",
        )
        .await?;
        Ok(())
    }

    async fn remove_label(&self, issue: &IssueId, label: &str) -> Result<()> {
        let mut url = Url::parse(&self.repo_url(issue, &format!("/issues/{}/labels", issue.number)))
            .context("Invalid GitHub API URL")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API URL cannot have path segments"))?
            .push(label);
        self.send(self.request(Method::DELETE, url), "remove label")
            .await?;
        Ok(())
    }

    async fn set_commit_status(&self, issue: &IssueId, status: &CommitStatus) -> Result<()> {
        let url = self.repo_url(issue, &format!("/statuses/{}", status.sha));
        let request = CreateStatusRequest {
            state: status.state.as_str(),
            context: &status.context,
            description: truncate_description(&status.description),
            target_url: status.target_url.as_deref(),
        };
        self.send(self.request(Method::POST, url).json(&request), "set commit status")
            .await?;
        Ok(())
    }

    async fn update_milestone(&self, issue: &IssueId, milestone: &Milestone) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/{}", issue.number));
        self.send(
            self.request(Method::PATCH, url)
                .json(&json!({ "milestone": milestone.id })),
            "update milestone",
        )
        .await?;
        Ok(())
    }

    async fn set_issue_state(&self, issue: &IssueId, state: IssueState) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/{}", issue.number));
        self.send(
            self.request(Method::PATCH, url).json(&json!({ "state": state })),
            "set issue state",
        )
        .await?;
        Ok(())
    }

    async fn list_commits(&self, issue: &IssueId) -> Result<Vec<CommitSha>> {
        let commits: Vec<CommitResponse> = self
            .get_paged(
                &self.repo_url(issue, &format!("/pulls/{}/commits", issue.number)),
                "list commits",
            )
            .await?;
        Ok(commits.into_iter().map(|c| CommitSha(c.sha)).collect())
    }

    async fn set_reaction(
        &self,
        issue: &IssueId,
        comment_id: CommentId,
        emoji: &str,
    ) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/comments/{}/reactions", comment_id));
        self.send(
            self.request(Method::POST, url).json(&json!({ "content": emoji })),
            "set reaction",
        )
        .await?;
        Ok(())
    }

    async fn add_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/{}/assignees", issue.number));
        self.send(
            self.request(Method::POST, url).json(&json!({ "assignees": users })),
            "add assignees",
        )
        .await?;
        Ok(())
    }

    async fn remove_assignees(&self, issue: &IssueId, users: &[String]) -> Result<()> {
        let url = self.repo_url(issue, &format!("/issues/{}/assignees", issue.number));
        self.send(
            self.request(Method::DELETE, url).json(&json!({ "assignees": users })),
            "remove assignees",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> IssueId {
        IssueId::new("org", "repo", 12)
    }

    #[test]
    fn test_snapshot_from_responses() {
        let response: IssueResponse = serde_json::from_value(json!({
            "user": {"login": "erin"},
            "title": "Fix things",
            "state": "open",
            "labels": [{"name": "code-approved"}],
            "assignees": [{"login": "bob"}],
            "milestone": {"number": 3, "title": "v3"},
            "pull_request": {"url": "x"}
        }))
        .unwrap();
        let comments: Vec<CommentResponse> = serde_json::from_value(json!([
            {"id": 1, "body": "+1", "user": {"login": "alice"}, "created_at": "2024-05-01T12:00:00Z"},
            {"id": 2, "body": null, "user": {"login": "bob"}, "created_at": null}
        ]))
        .unwrap();
        let statuses: Vec<StatusResponse> = serde_json::from_value(json!([
            {"context": "ci/12/main/x86_64", "state": "success", "target_url": null, "description": "ok"},
            {"context": "weird", "state": "queued", "target_url": null, "description": null}
        ]))
        .unwrap();
        let pull = PullInfo {
            head_sha: CommitSha::from("abc"),
            base_branch: "main".into(),
            commit_count: 2,
            tree_sha: Some("tree".into()),
        };

        let snapshot = to_snapshot(&issue(), response, comments, Some(pull), statuses);
        assert_eq!(snapshot.author, "erin");
        assert!(snapshot.labels.contains("code-approved"));
        assert!(snapshot.assignees.contains("bob"));
        assert_eq!(snapshot.milestone.as_ref().map(|m| m.id), Some(3));
        assert_eq!(snapshot.comments.len(), 2);
        assert_eq!(snapshot.comments[1].body, "");
        assert_eq!(snapshot.statuses.len(), 1);
        assert_eq!(snapshot.statuses[0].sha, CommitSha::from("abc"));
        assert!(snapshot.is_pull_request());
    }

    #[test]
    fn test_closed_issue_state() {
        let response: IssueResponse = serde_json::from_value(json!({
            "user": {"login": "erin"},
            "state": "closed",
            "milestone": null,
            "pull_request": null
        }))
        .unwrap();
        let snapshot = to_snapshot(&issue(), response, vec![], None, vec![]);
        assert_eq!(snapshot.state, IssueState::Closed);
        assert!(!snapshot.is_pull_request());
    }

    #[test]
    fn test_description_truncated() {
        let long = "x".repeat(200);
        assert_eq!(truncate_description(&long).len(), MAX_STATUS_DESCRIPTION);
        assert_eq!(truncate_description("short"), "short");
    }

    #[test]
    fn test_urls() {
        let client = GitHubClient::new("https://api.github.com/", "t").unwrap();
        assert_eq!(
            client.repo_url(&issue(), "/issues/12"),
            "https://api.github.com/repos/org/repo/issues/12"
        );
    }
}
