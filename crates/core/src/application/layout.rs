// Storage layout of one workspace backup
//
// <workspace>/
//   manifest.json
//   projects/<key>.json
//   repositories/<slug>/repository.json
//   repositories/<slug>/pull_requests/<id>.json (+ <id>/comments.json, <id>/activity.json)
//   repositories/<slug>/issues/<id>.json (+ <id>/comments.json)
//   repositories/<slug>/git/ (bare mirror)

#[derive(Debug, Clone)]
pub struct BackupLayout {
    workspace: String,
}

impl BackupLayout {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn manifest(&self) -> String {
        format!("{}/manifest.json", self.workspace)
    }

    pub fn project(&self, key: &str) -> String {
        format!("{}/projects/{}.json", self.workspace, key)
    }

    pub fn repository_dir(&self, slug: &str) -> String {
        format!("{}/repositories/{}", self.workspace, slug)
    }

    pub fn repository(&self, slug: &str) -> String {
        format!("{}/repository.json", self.repository_dir(slug))
    }

    pub fn pull_request(&self, slug: &str, id: u64) -> String {
        format!("{}/pull_requests/{}.json", self.repository_dir(slug), id)
    }

    pub fn pull_request_comments(&self, slug: &str, id: u64) -> String {
        format!("{}/pull_requests/{}/comments.json", self.repository_dir(slug), id)
    }

    pub fn pull_request_activity(&self, slug: &str, id: u64) -> String {
        format!("{}/pull_requests/{}/activity.json", self.repository_dir(slug), id)
    }

    pub fn issue(&self, slug: &str, id: u64) -> String {
        format!("{}/issues/{}.json", self.repository_dir(slug), id)
    }

    pub fn issue_comments(&self, slug: &str, id: u64) -> String {
        format!("{}/issues/{}/comments.json", self.repository_dir(slug), id)
    }

    pub fn mirror(&self, slug: &str) -> String {
        format!("{}/git", self.repository_dir(slug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_scoped_to_workspace() {
        let layout = BackupLayout::new("acme");
        assert_eq!(layout.manifest(), "acme/manifest.json");
        assert_eq!(layout.project("CORE"), "acme/projects/CORE.json");
        assert_eq!(
            layout.pull_request_comments("api", 7),
            "acme/repositories/api/pull_requests/7/comments.json"
        );
        assert_eq!(layout.mirror("api"), "acme/repositories/api/git");
    }
}
