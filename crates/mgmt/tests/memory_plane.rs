use apiary_core::{ApiaryError, Kind, MetadataEntry};
use apiary_mgmt::{Call, ManagementApi, MemoryPlane};
use serde_json::json;

#[tokio::test]
async fn records_follow_create_update_delete() {
    let plane = MemoryPlane::new("dev", "acme");
    let created = plane.create(Kind::Application, &json!({"name": "shop"})).await.unwrap();
    assert_eq!(created.payload["id"], created.remote_id.as_str());

    let updated = plane.update(Kind::Application, &created.remote_id, &json!({"name": "shop2"})).await.unwrap();
    assert_eq!(updated.remote_id, created.remote_id);
    assert_eq!(updated.version.as_deref(), Some("2"));

    plane.delete(Kind::Application, &created.remote_id).await.unwrap();
    assert!(plane.get(Kind::Application, &created.remote_id).await.unwrap().is_none());
    let again = plane.delete(Kind::Application, &created.remote_id).await.unwrap_err();
    assert!(again.is_not_found());

    assert_eq!(plane.count(Call::is_write), 4);
}

#[tokio::test]
async fn injected_failure_hits_exactly_one_call() {
    let plane = MemoryPlane::default();
    plane.fail_next(ApiaryError::from_status(503, "create", "Application", "down"));
    assert!(plane.create(Kind::Application, &json!({})).await.unwrap_err().is_retryable());
    assert!(plane.create(Kind::Application, &json!({})).await.is_ok());
    assert_eq!(plane.calls().len(), 2);
}

#[tokio::test]
async fn metadata_keys_are_assigned_by_the_plane() {
    let plane = MemoryPlane::default();
    let app = plane.create(Kind::Application, &json!({"name": "shop"})).await.unwrap();
    let owner = plane.create_metadata(&app.remote_id, &MetadataEntry::new("owner", "alice")).await.unwrap();
    let key = owner.remote_key.clone().unwrap();

    let edited = MetadataEntry { value: "bob".into(), ..owner };
    plane.update_metadata(&app.remote_id, &edited).await.unwrap();
    assert_eq!(plane.metadata(&app.remote_id)[0].value, "bob");

    plane.delete_metadata(&app.remote_id, &key).await.unwrap();
    assert!(plane.list_metadata(&app.remote_id).await.unwrap().is_empty());
    assert!(plane.delete_metadata(&app.remote_id, &key).await.unwrap_err().is_not_found());
}
