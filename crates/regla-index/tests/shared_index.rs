use std::sync::Arc;
use std::time::Duration;

use regla_core::{ChunkMeta, ProviderKind, SearchDiagnostic};
use regla_embed::testing::{FlakyProvider, HashingProvider};
use regla_embed::{EmbeddingProvider, NullProvider};
use regla_index::{persist, IndexPaths, SharedIndex, VectorIndex};

const DIM: usize = 256;
const EMBED_TIMEOUT: Duration = Duration::from_secs(5);

fn corpus() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        ("c1", "tomo-1", "Zoning permit requirements"),
        ("c2", "tomo-1", "Environmental review steps"),
        ("c3", "tomo-2", "Historic preservation criteria"),
        ("c4", "tomo-2", "Parking ratios for commercial districts"),
        ("c5", "tomo-3", "Signage height and illumination limits"),
    ]
}

fn metas_and_texts() -> (Vec<ChunkMeta>, Vec<String>) {
    corpus()
        .into_iter()
        .map(|(id, doc, text)| {
            (
                ChunkMeta {
                    chunk_id: id.into(),
                    doc_id: doc.into(),
                    heading_path: format!("{doc} > {id}"),
                    page_start: Some(1),
                    page_end: Some(2),
                },
                text.to_string(),
            )
        })
        .unzip()
}

async fn populated(dir: &std::path::Path) -> (SharedIndex, HashingProvider) {
    let provider = HashingProvider::new(DIM);
    let shared = SharedIndex::empty(IndexPaths::in_dir(dir));
    let (metas, texts) = metas_and_texts();
    let report = shared.add(&provider, &texts, metas, 2, EMBED_TIMEOUT).await.unwrap();
    assert_eq!(report.added, 5);
    assert!(report.persisted);
    (shared, provider)
}

#[tokio::test]
async fn every_indexed_text_retrieves_itself() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;

    for (id, _, text) in corpus() {
        let query = provider.embed(text).await.unwrap();
        let result = shared.search(&query, 1).await;
        assert!(result.diagnostic.is_none());
        assert_eq!(result.hits[0].meta.chunk_id, id);
        assert!(result.hits[0].score >= 0.99, "{id}: {}", result.hits[0].score);
    }
}

#[tokio::test]
async fn persisted_index_answers_identically_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;

    let fresh = SharedIndex::open(IndexPaths::in_dir(dir.path()));
    for query_text in ["permit requirements", "historic criteria", "parking"] {
        let query = provider.embed(query_text).await.unwrap();
        let before = shared.search(&query, 3).await;
        let after = fresh.search(&query, 3).await;
        assert_eq!(before, after, "query {query_text}");
    }
    assert_eq!(fresh.stats().await.entries, 5);
}

#[tokio::test]
async fn missing_metadata_loads_with_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let (_, provider) = populated(dir.path()).await;
    let paths = IndexPaths::in_dir(dir.path());
    std::fs::remove_file(&paths.metadata).unwrap();

    let fresh = SharedIndex::open(paths);
    let stats = fresh.stats().await;
    assert_eq!(stats.entries, 5);
    assert!(!stats.warnings.is_empty());

    let query = provider.embed("Historic preservation criteria").await.unwrap();
    let result = fresh.search(&query, 1).await;
    assert_eq!(result.hits[0].meta.chunk_id, "2");
    assert!(result.hits[0].meta.doc_id.is_empty());
}

#[tokio::test]
async fn short_metadata_is_padded() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path()).await;
    let paths = IndexPaths::in_dir(dir.path());
    let content = std::fs::read_to_string(&paths.metadata).unwrap();
    let first_two: Vec<&str> = content.lines().take(2).collect();
    std::fs::write(&paths.metadata, first_two.join("\n")).unwrap();

    let loaded = persist::load(&paths).unwrap().unwrap();
    let ids: Vec<&str> = loaded
        .index
        .metas()
        .iter()
        .map(|m| m.chunk_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c1", "c2", "2", "3", "4"]);
    assert_eq!(loaded.warnings.len(), 1);
}

#[tokio::test]
async fn legacy_id_only_records_get_positional_ids() {
    let dir = tempfile::tempdir().unwrap();
    populated(dir.path()).await;
    let paths = IndexPaths::in_dir(dir.path());
    let legacy: Vec<String> = (0..5).map(|i| format!("{{\"id\": {i}}}")).collect();
    std::fs::write(&paths.metadata, legacy.join("\n")).unwrap();

    let loaded = persist::load(&paths).unwrap().unwrap();
    assert_eq!(loaded.index.metas()[4].chunk_id, "4");
    assert!(loaded.warnings.is_empty());
}

#[tokio::test]
async fn corrupt_artifact_degrades_to_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::in_dir(dir.path());
    std::fs::write(&paths.vectors, b"FAISS garbage").unwrap();

    let shared = SharedIndex::open(paths);
    let result = shared.search(&[0.0; DIM], 5).await;
    assert!(result.hits.is_empty());
    assert!(matches!(
        result.diagnostic,
        Some(SearchDiagnostic::IndexUnavailable { .. })
    ));
    assert!(shared.stats().await.unavailable.is_some());
}

#[tokio::test]
async fn wrong_query_width_is_a_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, _) = populated(dir.path()).await;

    let other = HashingProvider::new(64);
    let query = other.embed("permit requirements").await.unwrap();
    let result = shared.search(&query, 5).await;
    assert!(result.hits.is_empty());
    assert_eq!(
        result.diagnostic,
        Some(SearchDiagnostic::DimensionMismatch {
            index: DIM,
            provider: 64
        })
    );
}

#[tokio::test]
async fn failed_batch_drops_its_metadata_too() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FlakyProvider::new(HashingProvider::new(DIM)).failing_batches([1]);
    let shared = SharedIndex::empty(IndexPaths::in_dir(dir.path()));
    let (metas, texts) = metas_and_texts();

    let report = shared.add(&provider, &texts, metas, 2, EMBED_TIMEOUT).await.unwrap();
    assert_eq!(report.requested, 5);
    assert_eq!(report.added, 3);
    assert_eq!(report.skipped, 2);
    assert_eq!(provider.batch_calls(), 3);

    let loaded = persist::load(&IndexPaths::in_dir(dir.path()))
        .unwrap()
        .unwrap();
    let ids: Vec<&str> = loaded
        .index
        .metas()
        .iter()
        .map(|m| m.chunk_id.as_str())
        .collect();
    assert_eq!(ids, vec!["c1", "c2", "c5"]);

    let hashing = HashingProvider::new(DIM);
    for (position, (id, _, text)) in corpus()
        .into_iter()
        .filter(|(id, _, _)| ["c1", "c2", "c5"].contains(id))
        .enumerate()
    {
        assert_eq!(loaded.index.metas()[position].chunk_id, id);
        assert_eq!(
            loaded.index.vector(position).unwrap(),
            hashing.vector(text).as_slice()
        );
    }
}

#[tokio::test]
async fn null_provider_add_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::in_dir(dir.path());
    let shared = SharedIndex::empty(paths.clone());
    let (metas, texts) = metas_and_texts();

    let report = shared.add(&NullProvider, &texts, metas, 64, EMBED_TIMEOUT).await.unwrap();
    assert_eq!(report.added, 0);
    assert!(report.rejected.is_some());
    assert!(!paths.vectors.exists());
}

#[tokio::test]
async fn mismatched_provider_add_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, _) = populated(dir.path()).await;
    let narrow = HashingProvider::new(32);

    let report = shared
        .add(
            &narrow,
            &["Nuevo artículo".to_string()],
            vec![ChunkMeta::default()],
            64,
            EMBED_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(report.added, 0);
    assert!(report.rejected.unwrap().contains("dimension mismatch"));
    assert_eq!(shared.stats().await.entries, 5);
}

#[tokio::test]
async fn misaligned_add_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedIndex::empty(IndexPaths::in_dir(dir.path()));
    let result = shared
        .add(
            &HashingProvider::new(DIM),
            &["a".to_string(), "b".to_string()],
            vec![ChunkMeta::default()],
            64,
            EMBED_TIMEOUT,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn readd_shadows_then_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;

    let updated = ChunkMeta {
        chunk_id: "c3".into(),
        doc_id: "tomo-2".into(),
        heading_path: "tomo-2 > c3".into(),
        page_start: Some(9),
        page_end: Some(9),
    };
    let text = "Historic preservation criteria amended in 2024".to_string();
    shared
        .add(&provider, std::slice::from_ref(&text), vec![updated], 64, EMBED_TIMEOUT)
        .await
        .unwrap();

    let query = provider.embed(&text).await.unwrap();
    let hits = shared.search(&query, 10).await.hits;
    let c3: Vec<_> = hits.iter().filter(|h| h.meta.chunk_id == "c3").collect();
    assert_eq!(c3.len(), 1);
    assert_eq!(c3[0].meta.page_start, Some(9));

    let stats = shared.stats().await;
    assert_eq!(stats.entries, 6);
    assert_eq!(stats.shadowed_entries, 1);

    assert_eq!(shared.compact().await.unwrap(), 1);
    let fresh = SharedIndex::open(IndexPaths::in_dir(dir.path()));
    let stats = fresh.stats().await;
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.shadowed_entries, 0);
}

#[tokio::test]
async fn empty_chunk_ids_are_generated() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedIndex::empty(IndexPaths::in_dir(dir.path()));
    let meta = ChunkMeta {
        doc_id: "tomo-9".into(),
        ..ChunkMeta::default()
    };
    shared
        .add(
            &HashingProvider::new(DIM),
            &["Regla 9.1 Disposiciones generales".to_string()],
            vec![meta],
            64,
            EMBED_TIMEOUT,
        )
        .await
        .unwrap();

    let loaded = persist::load(&IndexPaths::in_dir(dir.path()))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.index.metas()[0].chunk_id.len(), 16);
}

#[tokio::test]
async fn replace_swaps_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;

    let text = "Reglamento Conjunto 2023";
    let index = VectorIndex::build(
        DIM,
        vec![provider.vector(text)],
        vec![ChunkMeta {
            chunk_id: "only".into(),
            ..ChunkMeta::default()
        }],
    )
    .unwrap();
    let backup = persist::backup(shared.paths()).unwrap();
    assert!(backup.unwrap().exists());
    assert!(shared.replace(index).await);

    let fresh = SharedIndex::open(IndexPaths::in_dir(dir.path()));
    let query = provider.embed(text).await.unwrap();
    let hits = fresh.search(&query, 5).await.hits;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].meta.chunk_id, "only");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn searches_run_alongside_adds() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;
    let shared = Arc::new(shared);
    let provider = Arc::new(provider.with_kind(ProviderKind::Local));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let shared = Arc::clone(&shared);
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            if i % 4 == 0 {
                let text = format!("Enmienda número {i}");
                shared
                    .add(
                        provider.as_ref(),
                        &[text],
                        vec![ChunkMeta {
                            chunk_id: format!("new-{i}"),
                            ..ChunkMeta::default()
                        }],
                        64,
                        EMBED_TIMEOUT,
                    )
                    .await
                    .map(|r| r.added)
                    .unwrap_or(0)
            } else {
                let query = provider.vector("Zoning permit requirements");
                let result = shared.search(&query, 3).await;
                assert_eq!(result.hits[0].meta.chunk_id, "c1");
                0
            }
        }));
    }

    let mut added = 0;
    for task in tasks {
        added += task.await.unwrap();
    }
    assert_eq!(added, 2);
    assert_eq!(shared.stats().await.entries, 7);
}

#[tokio::test]
async fn failed_metadata_write_keeps_the_previous_pair() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, provider) = populated(dir.path()).await;
    let paths = IndexPaths::in_dir(dir.path());
    std::fs::create_dir(dir.path().join("metas.jsonl.tmp")).unwrap();

    let report = shared
        .add(
            &provider,
            &["Loading dock dimensions".to_string()],
            vec![ChunkMeta {
                chunk_id: "c6".into(),
                doc_id: "tomo-3".into(),
                ..ChunkMeta::default()
            }],
            64,
            EMBED_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    assert!(!report.persisted);
    assert!(!dir.path().join("vectors.idx.tmp").exists());

    let loaded = persist::load(&paths).unwrap().unwrap();
    assert!(loaded.warnings.is_empty(), "{:?}", loaded.warnings);
    assert_eq!(loaded.index.len(), 5);
    assert_eq!(loaded.index.metas().len(), 5);
    assert!(loaded.index.metas().iter().all(|m| m.chunk_id != "c6"));
}

#[tokio::test]
async fn slow_batches_are_skipped_after_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::in_dir(dir.path());
    let shared = SharedIndex::empty(paths.clone());
    let slow = HashingProvider::new(DIM).with_delay(Duration::from_secs(3600));
    let (metas, texts) = metas_and_texts();

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        shared.add(&slow, &texts, metas, 2, Duration::from_millis(50)),
    )
    .await
    .expect("add returns once every batch has timed out")
    .unwrap();

    assert_eq!(report.requested, 5);
    assert_eq!(report.added, 0);
    assert_eq!(report.skipped, 5);
    assert!(!paths.vectors.exists());
}

#[tokio::test]
async fn add_over_unreadable_artifact_backs_it_up() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::in_dir(dir.path());
    std::fs::write(&paths.vectors, b"FAISS garbage").unwrap();

    let shared = SharedIndex::open(paths.clone());
    assert!(shared.stats().await.unavailable.is_some());

    let provider = HashingProvider::new(DIM);
    let (metas, texts) = metas_and_texts();
    let report = shared
        .add(&provider, &texts, metas, 64, EMBED_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(report.added, 5);
    assert!(report.persisted);

    let backup = report.backup.expect("unreadable artifact backed up");
    assert_eq!(std::fs::read(&backup).unwrap(), b"FAISS garbage");
    assert_eq!(SharedIndex::open(paths).stats().await.entries, 5);
}

#[tokio::test]
async fn first_add_to_a_missing_index_needs_no_backup() {
    let dir = tempfile::tempdir().unwrap();
    let shared = SharedIndex::open(IndexPaths::in_dir(dir.path()));
    let (metas, texts) = metas_and_texts();

    let report = shared
        .add(&HashingProvider::new(DIM), &texts, metas, 64, EMBED_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(report.added, 5);
    assert!(report.backup.is_none());
}
