//! Integration tests for the traced filesystem operations.
//!
//! Tests verify:
//! - stat/readdir/read/write/mkdir/delete/move/copy against a node tree
//! - access control through delegated `fs:` permissions
//! - the stable error codes request handlers rely on
//! - copy via copy-tree, via the manual walk, and the unsupported case
//! - copy and move refuse to nest a directory inside itself
//! - stat waits for an in-flight write

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cumulus_kernel::fs::{FallbackProvider, LocalProvider, ProviderMethod, Route, StatOptions, TreeProvider};
use cumulus_kernel::operation::{OpContext, Operation};
use cumulus_kernel::ops::{DeleteOp, DeleteTarget};
use cumulus_kernel::{Capability, CoreConfig, FsProvider, MountTable, Selector};

use common::{Kernel, path};

fn tree_without_copy() -> TreeProvider {
    let caps = TreeProvider::new().capabilities().without(Capability::CopyTree);
    TreeProvider::new().with_capabilities(caps)
}

// ============================================================================
// Basic operations
// ============================================================================

#[tokio::test]
async fn write_read_and_list() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;

    let file = k.ops.write(&alice, &path("/alice"), "notes.txt", b"hello", false).await.unwrap();
    assert_eq!(file.path, "/alice/notes.txt");
    assert_eq!(file.size, 5);
    assert_eq!(file.owner_id, Some(alice.user_record().id));

    let data = k.ops.read(&alice, &Selector::Uid(file.uid)).await.unwrap();
    assert_eq!(data, b"hello");

    k.ops.mkdir(&alice, &path("/alice"), "empty").await.unwrap();
    let mut names: Vec<_> = k
        .ops
        .readdir(&alice, &path("/alice"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["empty", "notes.txt"]);

    let empty = k.ops.readdir(&alice, &path("/alice/empty")).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn stat_of_missing_node_is_none() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    let entry = k.ops.stat(&alice, &path("/alice/nope"), StatOptions::default()).await.unwrap();
    assert!(entry.is_none());
}

#[tokio::test]
async fn error_codes_for_bad_writes() {
    let mut config = CoreConfig::default();
    config.max_file_size = Some(4);
    let k = Kernel::with_config(config);
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.write(&alice, &path("/alice"), "a.txt", b"1", false).await.unwrap();

    let cases = [
        (k.ops.write(&alice, &path("/alice"), "a.txt", b"2", false).await, "item_with_same_name_exists"),
        (k.ops.write(&alice, &path("/alice"), "a/b", b"2", false).await, "invalid_file_name"),
        (k.ops.write(&alice, &path("/alice/missing"), "x", b"2", false).await, "dest_does_not_exist"),
        (k.ops.write(&alice, &path("/alice"), "big.bin", b"12345", false).await, "file_too_large"),
        (k.ops.mkdir(&alice, &path("/alice"), "a.txt").await, "item_with_same_name_exists"),
    ];
    for (result, code) in cases {
        assert_eq!(result.unwrap_err().code(), code);
    }

    let replaced = k.ops.write(&alice, &path("/alice"), "a.txt", b"22", true).await.unwrap();
    assert_eq!(replaced.size, 2);
    assert_eq!(k.ops.read(&alice, &path("/alice/a.txt")).await.unwrap(), b"22");
}

// ============================================================================
// Access control
// ============================================================================

#[tokio::test]
async fn other_users_need_a_grant() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    let (_, bob) = k.user("bob").await;
    k.ops.write(&alice, &path("/alice"), "doc.txt", b"secret", false).await.unwrap();

    let err = k.ops.read(&bob, &path("/alice/doc.txt")).await.unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert!(!err.to_string().contains("/alice"));

    k.permissions
        .grant_user_user_permission(&alice, "bob", "fs:/alice:read", json!({}), None)
        .await
        .unwrap();
    assert_eq!(k.ops.read(&bob, &path("/alice/doc.txt")).await.unwrap(), b"secret");

    // Read does not imply write.
    let err = k.ops.write(&bob, &path("/alice"), "doc.txt", b"x", true).await.unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert!(err.to_string().contains("/alice/doc.txt"));
}

#[tokio::test]
async fn stat_lists_shares_of_the_owner() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    k.user("bob").await;
    let doc = k.ops.write(&alice, &path("/alice"), "doc.txt", b"x", false).await.unwrap();

    k.permissions
        .grant_user_user_permission(&alice, "bob", &format!("fs:{}:write", doc.uid), json!({}), None)
        .await
        .unwrap();

    let options = StatOptions {
        shares: true,
        ..StatOptions::default()
    };
    let entry = k.ops.stat(&alice, &path("/alice/doc.txt"), options).await.unwrap().unwrap();
    let shares = entry.shares.expect("shares requested");
    assert_eq!(shares.users.len(), 1);
    assert_eq!(shares.users[0].name, "bob");
    assert_eq!(shares.users[0].permission, format!("fs:{}:write", doc.uid));
    assert!(shares.apps.is_empty());
}

// ============================================================================
// Delete and move
// ============================================================================

#[tokio::test]
async fn delete_rules() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    let system = k.permissions.system_actor().await.unwrap();
    k.ops.mkdir(&alice, &path("/alice"), "dir").await.unwrap();
    k.ops.write(&alice, &path("/alice/dir"), "f", b"1", false).await.unwrap();
    k.ops.mkdir(&alice, &path("/alice/dir"), "sub").await.unwrap();

    let err = k.ops.delete(&alice, &path("/alice/dir"), false).await.unwrap_err();
    assert_eq!(err.code(), "dir_not_empty");

    k.ops.delete(&alice, &path("/alice/dir"), true).await.unwrap();
    assert!(k.ops.stat(&alice, &path("/alice/dir"), StatOptions::default()).await.unwrap().is_none());

    let err = k.ops.delete(&system, &Selector::Root, true).await.unwrap_err();
    assert_eq!(err.code(), "immutable");

    let pinned = k.ops.write(&alice, &path("/alice"), "pinned", b"", false).await.unwrap();
    k.tree.set_immutable(pinned.uid, true).unwrap();
    let err = k.ops.delete(&alice, &path("/alice/pinned"), false).await.unwrap_err();
    assert_eq!(err.code(), "immutable");
}

#[tokio::test]
async fn delete_of_a_missing_node_is_traced() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;

    let err = k.ops.delete(&alice, &path("/alice/missing"), false).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert!(k.ops.trace().ongoing().is_empty());

    let request = k.ops.trace().add_frame("request", None);
    let cx = OpContext::within(alice.clone(), k.ops.trace().clone(), Arc::clone(&request));
    let err = DeleteOp {
        ops: &k.ops,
        target: DeleteTarget::Selector(&path("/alice/missing")),
        recursive: false,
    }
    .run(&cx)
    .await
    .unwrap_err();
    assert_eq!(err.code(), "not_found");

    let children = request.children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].label(), "delete");
    assert!(children[0].get_attr("selector").is_some());
    assert!(children[0].get_attr("api-error").is_some());
}

#[tokio::test]
async fn move_into_itself_is_rejected() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.mkdir(&alice, &path("/alice"), "a").await.unwrap();
    k.ops.mkdir(&alice, &path("/alice/a"), "b").await.unwrap();

    for dest in ["/alice/a", "/alice/a/b"] {
        let err = k
            .ops
            .move_node(&alice, &path("/alice/a"), &path(dest), Some("inner"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cannot_move_item_into_itself");
    }
    assert!(k.ops.stat(&alice, &path("/alice/a/b"), StatOptions::default()).await.unwrap().is_some());
}

#[tokio::test]
async fn move_renames_and_checks_collisions() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.mkdir(&alice, &path("/alice"), "a").await.unwrap();
    k.ops.mkdir(&alice, &path("/alice"), "b").await.unwrap();
    let f = k.ops.write(&alice, &path("/alice/a"), "f.txt", b"1", false).await.unwrap();
    k.ops.write(&alice, &path("/alice/b"), "taken", b"2", false).await.unwrap();

    let moved = k
        .ops
        .move_node(&alice, &path("/alice/a/f.txt"), &path("/alice/b"), Some("g.txt"))
        .await
        .unwrap();
    assert_eq!(moved.uid, f.uid);
    assert_eq!(moved.path, "/alice/b/g.txt");

    let err = k
        .ops
        .move_node(&alice, &path("/alice/b/g.txt"), &path("/alice/b"), Some("taken"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "item_with_same_name_exists");

    let err = k
        .ops
        .move_node(&alice, &path("/alice/b/g.txt"), &path("/alice/nowhere"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "dest_does_not_exist");
}

#[tokio::test]
async fn move_across_providers_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(TreeProvider::new());
    let mut mounts = MountTable::single(tree.clone());
    // The first user created gets id 1.
    let alice_id = 1;
    mounts.mount(
        "/mnt/disk",
        Arc::new(LocalProvider::new(dir.path()).mounted_at("/mnt/disk").owned_by(alice_id)),
    );
    let k = Kernel::with_mounts(tree, mounts, CoreConfig::default());
    let (alice, _) = k.user_with_home("alice").await;
    assert_eq!(alice.user_record().id, alice_id);
    k.ops.write(&alice, &path("/alice"), "f.txt", b"1", false).await.unwrap();

    let err = k
        .ops
        .move_node(&alice, &path("/alice/f.txt"), &path("/mnt/disk"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_operation");
}

// ============================================================================
// Copy
// ============================================================================

#[tokio::test]
async fn copy_uses_copy_tree() {
    let k = Kernel::new();
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.mkdir(&alice, &path("/alice"), "src").await.unwrap();
    let inner = k.ops.write(&alice, &path("/alice/src"), "f.txt", b"data", false).await.unwrap();

    let copy = k
        .ops
        .copy(&alice, &path("/alice/src"), &path("/alice"), Some("dst"))
        .await
        .unwrap();
    assert_eq!(copy.path, "/alice/dst");

    let copied = k
        .ops
        .stat(&alice, &path("/alice/dst/f.txt"), StatOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(copied.uid, inner.uid);
    assert_eq!(k.ops.read(&alice, &Selector::Uid(copied.uid)).await.unwrap(), b"data");

    let err = k
        .ops
        .copy(&alice, &path("/alice/src"), &path("/alice"), Some("dst"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "item_with_same_name_exists");
}

#[tokio::test]
async fn copy_without_copy_tree_is_unsupported_when_fallback_is_off() {
    let mut config = CoreConfig::default();
    config.copy_fallback = false;
    let k = Kernel::with_tree(tree_without_copy(), config);
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.write(&alice, &path("/alice"), "f.txt", b"1", false).await.unwrap();

    let err = k
        .ops
        .copy(&alice, &path("/alice/f.txt"), &path("/alice"), Some("g.txt"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_operation");
    assert!(k
        .ops
        .stat(&alice, &path("/alice/g.txt"), StatOptions::default())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn copy_falls_back_to_a_walk() {
    let k = Kernel::with_tree(tree_without_copy(), CoreConfig::default());
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.mkdir(&alice, &path("/alice"), "src").await.unwrap();
    k.ops.mkdir(&alice, &path("/alice/src"), "deep").await.unwrap();
    k.ops.write(&alice, &path("/alice/src"), "a.txt", b"a", false).await.unwrap();
    k.ops.write(&alice, &path("/alice/src/deep"), "b.txt", b"b", false).await.unwrap();

    let copy = k.ops.copy(&alice, &path("/alice/src"), &path("/alice"), Some("dst")).await.unwrap();
    assert!(copy.is_dir);
    assert_eq!(copy.owner_id, Some(alice.user_record().id));
    assert_eq!(k.ops.read(&alice, &path("/alice/dst/a.txt")).await.unwrap(), b"a");
    assert_eq!(k.ops.read(&alice, &path("/alice/dst/deep/b.txt")).await.unwrap(), b"b");
    assert!(k.ops.trace().ongoing().is_empty());
}

#[tokio::test]
async fn copy_into_itself_is_rejected() {
    let k = Kernel::with_tree(tree_without_copy(), CoreConfig::default());
    let (alice, _) = k.user_with_home("alice").await;
    k.ops.mkdir(&alice, &path("/alice"), "src").await.unwrap();
    k.ops.mkdir(&alice, &path("/alice/src"), "deep").await.unwrap();
    k.ops.write(&alice, &path("/alice/src"), "a.txt", b"a", false).await.unwrap();

    for dest in ["/alice/src", "/alice/src/deep"] {
        let err = k
            .ops
            .copy(&alice, &path("/alice/src"), &path(dest), Some("inner"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cannot_copy_item_into_itself");
    }

    let names: Vec<_> = k
        .ops
        .readdir(&alice, &path("/alice/src"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(!names.contains(&"inner".to_string()));
    assert!(k.ops.trace().ongoing().is_empty());

    // A sibling whose name shares the prefix is a valid destination.
    k.ops.mkdir(&alice, &path("/alice"), "src2").await.unwrap();
    let copy = k.ops.copy(&alice, &path("/alice/src"), &path("/alice/src2"), None).await.unwrap();
    assert_eq!(copy.path, "/alice/src2/src");
    assert_eq!(k.ops.read(&alice, &path("/alice/src2/src/a.txt")).await.unwrap(), b"a");
}

#[tokio::test]
async fn copy_from_local_disk_into_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("photos")).unwrap();
    std::fs::write(dir.path().join("photos/cat.jpg"), b"meow").unwrap();

    let tree = Arc::new(TreeProvider::new());
    let mut mounts = MountTable::single(tree.clone());
    mounts.mount(
        "/mnt/disk",
        Arc::new(LocalProvider::new(dir.path()).mounted_at("/mnt/disk").owned_by(1).read_only()),
    );
    let k = Kernel::with_mounts(tree, mounts, CoreConfig::default());
    let (alice, _) = k.user_with_home("alice").await;

    k.ops
        .copy(&alice, &path("/mnt/disk/photos"), &path("/alice"), None)
        .await
        .unwrap();
    assert_eq!(k.ops.read(&alice, &path("/alice/photos/cat.jpg")).await.unwrap(), b"meow");

    // The read-only disk declares no write capability.
    let err = k
        .ops
        .write(&alice, &path("/mnt/disk"), "new.txt", b"x", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_operation");
}

// ============================================================================
// Providers composed per method
// ============================================================================

#[tokio::test]
async fn fallback_provider_serves_operations() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("legacy.txt"), b"old").unwrap();

    // Only stat and readdir move to the new provider; the rest stays on disk.
    let primary: Arc<dyn FsProvider> = Arc::new(LocalProvider::new(dir.path()).owned_by(1));
    let legacy: Arc<dyn FsProvider> = Arc::new(LocalProvider::new(dir.path()).owned_by(1));
    let mut composed = FallbackProvider::new(primary, legacy);
    for method in ProviderMethod::ALL {
        let route = match method {
            ProviderMethod::Stat | ProviderMethod::Readdir => Route::Primary,
            _ => Route::Legacy,
        };
        composed = composed.route(method, route);
    }
    assert!(!composed.capabilities().contains(Capability::CopyTree));

    let tree = Arc::new(TreeProvider::new());
    let k = Kernel::with_mounts(tree, MountTable::single(Arc::new(composed)), CoreConfig::default());
    let (_, alice) = k.user("alice").await;

    let listing = k.ops.readdir(&alice, &Selector::Root).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(k.ops.read(&alice, &path("/legacy.txt")).await.unwrap(), b"old");
    k.ops.write(&alice, &Selector::Root, "new.txt", b"new", false).await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"new");
}

// ============================================================================
// Coordination
// ============================================================================

#[tokio::test]
async fn stat_waits_for_an_in_flight_write() {
    let k = Arc::new(Kernel::new());
    let (alice, home) = k.user_with_home("alice").await;
    let pending = k.tree.begin_write(&home, "late.txt").await.unwrap();

    let task = {
        let k = Arc::clone(&k);
        let alice = alice.clone();
        tokio::spawn(async move {
            k.ops
                .stat(&alice, &path("/alice/late.txt"), StatOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());

    let written = pending.commit(b"done", Some(alice.user_record().id)).unwrap();
    let seen = task.await.unwrap().unwrap().expect("entry after write");
    assert_eq!(seen.uid, written.uid);
}
