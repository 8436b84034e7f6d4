//! Commit/tag round trips against a local bare repository.

use std::path::Path;

use git2::{Repository, Signature};
use tempfile::TempDir;
use vm_gitstore::{GitConfigStore, RepoSettings, StoreError};

fn bare_repo_with_main(path: &Path) -> Repository {
    let repo = Repository::init_bare(path).expect("init bare repo");
    {
        let blob = repo.blob(b"# provisioning configs\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree_id = builder.write().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }
    repo.set_head("refs/heads/main").unwrap();
    repo
}

fn store_for(path: &Path) -> GitConfigStore {
    GitConfigStore::new(
        RepoSettings::new(path.to_string_lossy(), "main").with_base_path("clusters"),
    )
}

#[test]
fn test_commit_pending_pushes_files() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    let remote = bare_repo_with_main(&remote_path);
    let store = store_for(&remote_path);

    let record = store
        .commit_pending(
            "req-1",
            "dev",
            &[("main.tf", "# main\n"), ("terraform.tfvars", "cpu = 2\n")],
            "Pending config for req-1",
        )
        .expect("commit pending");

    assert_eq!(record.path, "clusters/dev/req-1");

    let head = remote
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.id().to_string(), record.commit_id);
    assert_eq!(head.message(), Some("Pending config for req-1"));

    let tree = head.tree().unwrap();
    let entry = tree
        .get_path(Path::new("clusters/dev/req-1/terraform.tfvars"))
        .unwrap();
    let blob = remote.find_blob(entry.id()).unwrap();
    assert_eq!(blob.content(), b"cpu = 2\n");
    assert!(tree.get_path(Path::new("README.md")).is_ok());
}

#[test]
fn test_identical_config_reuses_head() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    bare_repo_with_main(&remote_path);
    let store = store_for(&remote_path);
    let files = [("main.tf", "# main\n")];

    let first = store.commit_pending("req-2", "prod", &files, "first").unwrap();
    let second = store.commit_pending("req-2", "prod", &files, "second").unwrap();
    assert_eq!(first.commit_id, second.commit_id);

    let changed = store
        .commit_pending("req-2", "prod", &[("main.tf", "# changed\n")], "third")
        .unwrap();
    assert_ne!(first.commit_id, changed.commit_id);
}

#[test]
fn test_mark_applied_tags_commit() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    let remote = bare_repo_with_main(&remote_path);
    let store = store_for(&remote_path);

    let record = store
        .commit_pending("req-3", "dev", &[("main.tf", "# main\n")], "pending")
        .unwrap();
    store.mark_applied("req-3", &record.commit_id).unwrap();

    let tagged = remote
        .find_reference("refs/tags/applied/req-3")
        .expect("applied tag")
        .peel_to_commit()
        .unwrap();
    assert_eq!(tagged.id().to_string(), record.commit_id);
}

#[test]
fn test_rejects_escaping_paths() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    bare_repo_with_main(&remote_path);
    let store = store_for(&remote_path);

    let result = store.commit_pending("../etc", "dev", &[("main.tf", "")], "bad");
    assert!(matches!(result, Err(StoreError::InvalidPath(_))));

    let result = store.commit_pending("req-4", "dev", &[("../main.tf", "")], "bad");
    assert!(matches!(result, Err(StoreError::InvalidPath(_))));
}

#[test]
fn test_missing_branch_fails() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    bare_repo_with_main(&remote_path);
    let store = GitConfigStore::new(RepoSettings::new(remote_path.to_string_lossy(), "release"));

    let result = store.commit_pending("req-5", "dev", &[("main.tf", "")], "x");
    assert!(matches!(result, Err(StoreError::Git(_))));
}

#[test]
fn test_concurrent_commits_all_land() {
    let temp = TempDir::new().unwrap();
    let remote_path = temp.path().join("configs.git");
    let remote = bare_repo_with_main(&remote_path);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store_for(&remote_path);
                scope.spawn(move || {
                    let request_id = format!("req-c{i}");
                    let body = format!("# config {i}\n");
                    store.commit_pending(
                        &request_id,
                        "dev",
                        &[("main.tf", body.as_str())],
                        &format!("Pending config for {request_id}"),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert!(result.is_ok(), "commit failed: {result:?}");
    }

    let tree = remote
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .tree()
        .unwrap();
    for i in 0..4 {
        let path = format!("clusters/dev/req-c{i}/main.tf");
        assert!(tree.get_path(Path::new(&path)).is_ok(), "{path} missing");
    }
}
