mod common;

use scenevault::{Error, RestoreTarget};
use scenevault::types::{AccessLevel, Subject};
use tokio::io::AsyncReadExt;

const GLB: &str = "model/gltf-binary";
const DOC: &str = r#"{"asset": {"generator": "test"}}"#;

struct Fixture {
    _temp: tempfile::TempDir,
    vault: scenevault::SceneVault,
    admin: i64,
    scene: i64,
}

/// A scene with a primary document and one model file, written by its
/// owner.
async fn fixture() -> Fixture {
    let (temp, vault) = common::vault();
    let admin = vault.create_user("curator", false).unwrap().id;
    let scene = vault.create_scene("dragon", Some(admin)).unwrap().id;
    vault.write_document(scene.into(), DOC, Some(admin)).unwrap();
    common::tick();
    vault
        .write_file(scene.into(), "model.glb", GLB, Some(admin), &b"v1"[..])
        .await
        .unwrap();
    common::tick();
    Fixture {
        _temp: temp,
        vault,
        admin,
        scene,
    }
}

async fn read_model(f: &Fixture) -> Vec<u8> {
    let (_, mut reader) = f
        .vault
        .read_file(f.scene.into(), "model.glb", Some(f.admin))
        .await
        .unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    content
}

#[tokio::test]
async fn test_restore_to_generation_rewinds_content() {
    let f = fixture().await;
    f.vault
        .write_file(f.scene.into(), "model.glb", GLB, Some(f.admin), &b"v2"[..])
        .await
        .unwrap();
    common::tick();
    f.vault
        .write_file(f.scene.into(), "model.glb", GLB, Some(f.admin), &b"v3"[..])
        .await
        .unwrap();

    let changed = f
        .vault
        .restore(
            f.scene.into(),
            RestoreTarget::Generation {
                name: "model.glb",
                generation: 1,
            },
            Some(f.admin),
        )
        .unwrap();
    assert_eq!(changed, vec!["model.glb"]);
    assert_eq!(read_model(&f).await, b"v1");

    // History is extended, never rewritten.
    let history = f
        .vault
        .file_history(f.scene.into(), "model.glb", Some(f.admin))
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].generation, 4);
    assert_eq!(history[0].hash, history[3].hash);
}

#[tokio::test]
async fn test_restore_is_idempotent() {
    let f = fixture().await;
    f.vault
        .write_file(f.scene.into(), "model.glb", GLB, Some(f.admin), &b"v2"[..])
        .await
        .unwrap();

    let target = RestoreTarget::Generation {
        name: "model.glb",
        generation: 1,
    };
    let first = f.vault.restore(f.scene.into(), target, Some(f.admin)).unwrap();
    assert_eq!(first, vec!["model.glb"]);
    let second = f.vault.restore(f.scene.into(), target, Some(f.admin)).unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_restore_resurrects_and_removes() {
    let f = fixture().await;
    // Reference instant: the document write plus model.glb at v1.
    let reference = f
        .vault
        .file_history(f.scene.into(), "model.glb", Some(f.admin))
        .unwrap()[0]
        .id;

    f.vault
        .remove_file(f.scene.into(), "model.glb", Some(f.admin))
        .unwrap();
    common::tick();
    f.vault
        .write_file(f.scene.into(), "later.bin", GLB, Some(f.admin), &b"new"[..])
        .await
        .unwrap();

    let changed = f
        .vault
        .restore(f.scene.into(), RestoreTarget::Version(reference), Some(f.admin))
        .unwrap();
    // Names come back in name order: the resurrected model and the
    // tombstoned newcomer.
    assert_eq!(changed, vec!["later.bin", "model.glb"]);
    assert_eq!(read_model(&f).await, b"v1");
    assert!(matches!(
        f.vault
            .read_file(f.scene.into(), "later.bin", Some(f.admin))
            .await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn test_restore_never_removes_the_document() {
    let (_temp, vault) = common::vault();
    let admin = vault.create_user("curator", false).unwrap().id;
    let scene = vault.create_scene("dragon", Some(admin)).unwrap().id;

    // The model predates the document.
    let version = vault
        .write_file(scene.into(), "model.glb", GLB, Some(admin), &b"v1"[..])
        .await
        .unwrap();
    common::tick();
    vault.write_document(scene.into(), DOC, Some(admin)).unwrap();

    let result = vault.restore(scene.into(), RestoreTarget::Version(version.id), Some(admin));
    assert!(matches!(result, Err(Error::Conflict(_))));
    // Guard failures leave no writes behind.
    assert_eq!(
        vault
            .file_history(scene.into(), "scene.svx.json", Some(admin))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_restore_requires_admin() {
    let f = fixture().await;
    let writer = f.vault.create_user("writer", false).unwrap().id;
    f.vault
        .grant(
            f.scene.into(),
            Subject::User(writer),
            Some(AccessLevel::Write),
            Some(f.admin),
        )
        .unwrap();
    let outsider = f.vault.create_user("outsider", false).unwrap().id;
    f.vault
        .set_default_access(f.scene.into(), AccessLevel::None, Some(f.admin))
        .unwrap();

    let target = RestoreTarget::Generation {
        name: "model.glb",
        generation: 1,
    };
    // Write access on a visible scene: actionable refusal.
    assert!(matches!(
        f.vault.restore(f.scene.into(), target, Some(writer)),
        Err(Error::Unauthorized)
    ));
    // No access at all: indistinguishable from a missing scene.
    assert!(matches!(
        f.vault.restore(f.scene.into(), target, Some(outsider)),
        Err(Error::NotFound)
    ));

    // Raising the grant to admin unlocks the same call.
    f.vault
        .grant(
            f.scene.into(),
            Subject::User(writer),
            Some(AccessLevel::Admin),
            Some(f.admin),
        )
        .unwrap();
    f.vault.restore(f.scene.into(), target, Some(writer)).unwrap();
}

#[tokio::test]
async fn test_restore_document_to_earlier_generation() {
    let (_temp, vault) = common::vault();
    let admin = vault.create_user("curator", false).unwrap().id;
    let scene = vault.create_scene("foo", Some(admin)).unwrap().id;

    for i in 0..4 {
        vault
            .write_document(scene.into(), &format!(r#"{{"id":{i}}}"#), Some(admin))
            .unwrap();
        common::tick();
    }
    let history = vault
        .file_history(scene.into(), "scene.svx.json", Some(admin))
        .unwrap();
    let second = history.iter().find(|v| v.generation == 2).unwrap();

    let changed = vault
        .restore(scene.into(), RestoreTarget::Version(second.id), Some(admin))
        .unwrap();
    assert_eq!(changed, vec!["scene.svx.json"]);
    assert_eq!(
        vault.read_document(scene.into(), Some(admin)).unwrap(),
        r#"{"id":1}"#
    );
}

#[tokio::test]
async fn test_restore_target_validation() {
    let f = fixture().await;
    assert!(matches!(
        f.vault.restore(
            f.scene.into(),
            RestoreTarget::Generation {
                name: "",
                generation: 1
            },
            Some(f.admin),
        ),
        Err(Error::BadRequest(_))
    ));
    assert!(matches!(
        f.vault.restore(
            f.scene.into(),
            RestoreTarget::Generation {
                name: "model.glb",
                generation: 0
            },
            Some(f.admin),
        ),
        Err(Error::BadRequest(_))
    ));
    assert!(matches!(
        f.vault.restore(
            f.scene.into(),
            RestoreTarget::Generation {
                name: "model.glb",
                generation: 99
            },
            Some(f.admin),
        ),
        Err(Error::NotFound)
    ));

    // An id that matches no version row at all is malformed.
    assert!(matches!(
        f.vault.restore(
            f.scene.into(),
            RestoreTarget::Version(999_999),
            Some(f.admin),
        ),
        Err(Error::BadRequest(_))
    ));

    // A version id belonging to another scene reads as absent.
    let other = f.vault.create_scene("other", Some(f.admin)).unwrap().id;
    let foreign = f
        .vault
        .write_file(other.into(), "x.bin", GLB, Some(f.admin), &b"x"[..])
        .await
        .unwrap();
    assert!(matches!(
        f.vault
            .restore(f.scene.into(), RestoreTarget::Version(foreign.id), Some(f.admin)),
        Err(Error::NotFound)
    ));
}
