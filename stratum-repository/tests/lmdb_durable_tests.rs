//! Repositories over an LMDB durable tier.

use std::sync::Arc;

use serde_json::json;
use stratum_core::{Document, QueryStrategy, RepositoryOptions, Tier};
use stratum_repository::Pipeline;
use stratum_storage::{LmdbStore, MemoryStore};
use tempfile::TempDir;
use uuid::Uuid;

fn lmdb_pipeline(dir: &TempDir) -> Pipeline {
    Pipeline::builder()
        .durable(Arc::new(LmdbStore::open(dir.path(), 10, 16).unwrap()))
        .local(Arc::new(MemoryStore::for_tier(Tier::Local)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn documents_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let id = Uuid::now_v7();
    let player = Document::from_value(json!({"name": "ana", "stats": {"level": 4}})).unwrap();

    {
        let pipeline = lmdb_pipeline(&dir);
        let repo = pipeline
            .repository("players", &RepositoryOptions::durable_only())
            .await
            .unwrap();
        repo.insert(id, &player, QueryStrategy::ALL).await.unwrap();
        pipeline.close().await.unwrap();
    }

    let pipeline = lmdb_pipeline(&dir);
    assert!(pipeline.has_repository("players").await.unwrap());
    let repo = pipeline
        .repository("players", &RepositoryOptions::default())
        .await
        .unwrap();
    assert_eq!(repo.size().await.unwrap(), 1);
    assert_eq!(repo.get(id).await.unwrap(), Some(player));
}

#[tokio::test]
async fn dropped_repository_is_gone_from_durable_tier() {
    let dir = TempDir::new().unwrap();
    let pipeline = lmdb_pipeline(&dir);
    let repo = pipeline
        .repository("scratch", &RepositoryOptions::default())
        .await
        .unwrap();
    repo.insert(Uuid::now_v7(), &Document::new(), QueryStrategy::ALL)
        .await
        .unwrap();
    pipeline
        .repository("kept", &RepositoryOptions::default())
        .await
        .unwrap();

    assert!(pipeline.drop_repository("scratch").await.unwrap());
    let names: Vec<_> = pipeline.list_repositories().await.unwrap().into_iter().collect();
    assert_eq!(names, vec!["kept".to_string()]);

    let reopened = pipeline
        .repository("scratch", &RepositoryOptions::default())
        .await
        .unwrap();
    assert_eq!(reopened.size().await.unwrap(), 0);
}
