// Bitvault Infrastructure - Git Adapters
// Implements: GitBackend (primary in-process, fallback external executable)

pub mod cli_backend;
pub mod git2_backend;

pub use cli_backend::CliGitBackend;
pub use git2_backend::Git2Backend;

/// Refspec that mirrors every ref of the remote one-to-one
pub const MIRROR_REFSPEC: &str = "+refs/*:refs/*";

#[cfg(test)]
pub(crate) mod test_support {
    use git2::{Oid, Repository, Signature};
    use std::path::Path;

    /// Non-bare repository with one commit on its default branch
    pub fn seed_repo(dir: &Path) -> (Repository, Oid) {
        let repo = Repository::init(dir).unwrap();
        let oid = commit(&repo, "initial");
        (repo, oid)
    }

    pub fn commit(repo: &Repository, message: &str) -> Oid {
        let sig = Signature::now("Bitvault Test", "test@bitvault.invalid").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }
}
