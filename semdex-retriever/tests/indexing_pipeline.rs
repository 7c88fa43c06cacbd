//! End-to-end indexing: files on disk through analysis, embedding and storage.

mod support;

use anyhow::Result;
use semdex_context::ChunkType;
use semdex_embed::HashingProvider;
use semdex_retriever::retrieval::source::discover;
use semdex_retriever::{IndexManager, JobStatus, JobType, QueryFilter, SourceFile};
use std::collections::BTreeSet;
use std::sync::Arc;
use support::{DIMENSION, fast_pipeline, full_index, open, run_job, sample_repo, write};
use tempfile::tempdir;

/// `(id, path, content)` of every stored record.
async fn snapshot(manager: &IndexManager) -> Result<BTreeSet<(String, String, String)>> {
    let store = manager.store();
    let mut records = BTreeSet::new();
    for record in store.all_records().await? {
        let chunk = store.load_chunk(&record).await?;
        records.insert((record.id, record.relative_path, chunk.content));
    }
    Ok(records)
}

async fn ids_for(manager: &IndexManager, path: &str) -> Result<BTreeSet<String>> {
    Ok(manager
        .store()
        .records_for_path(path)
        .await?
        .into_iter()
        .map(|r| r.id)
        .collect())
}

fn hashing() -> Arc<HashingProvider> {
    Arc::new(HashingProvider::new(DIMENSION))
}

#[tokio::test]
async fn test_full_index_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;

    let first = full_index(&manager, &repo, dir.path()).await?;
    assert_eq!(first.progress.files_total, 3);
    assert_eq!(first.progress.files_processed, 3);
    assert_eq!(first.progress.files_skipped, 0);
    assert!(first.progress.chunks_embedded > 0);
    assert_eq!(first.progress.chunks_embedded, first.progress.chunks_total);
    let before = snapshot(&manager).await?;
    assert_eq!(before.len(), first.progress.chunks_total);

    let second = full_index(&manager, &repo, dir.path()).await?;
    assert_eq!(second.progress.chunks_embedded, 0);
    assert_eq!(second.progress.chunks_reused, first.progress.chunks_total);
    assert_eq!(snapshot(&manager).await?, before);
    Ok(())
}

#[tokio::test]
async fn test_incremental_update_replaces_only_changed_file() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;

    let old_report = ids_for(&manager, "tools/report.py").await?;
    let old_lib = ids_for(&manager, "src/lib.rs").await?;
    assert!(!old_report.is_empty());

    // Shifting every line changes every range in the file.
    let changed = format!(
        "# report helpers\n{}",
        std::fs::read_to_string(dir.path().join("tools/report.py"))?
    );
    write(dir.path(), "tools/report.py", &changed);

    let files = vec![SourceFile::under(dir.path(), dir.path().join("tools/report.py"))];
    let job = run_job(&manager, &repo, JobType::IncrementalUpdate, files).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.files_processed, 1);

    let new_report = ids_for(&manager, "tools/report.py").await?;
    assert!(!new_report.is_empty());
    assert!(new_report.is_disjoint(&old_report));
    for id in &old_report {
        assert!(manager.store().get(id).await?.is_none());
    }
    assert_eq!(ids_for(&manager, "src/lib.rs").await?, old_lib);
    Ok(())
}

#[tokio::test]
async fn test_incremental_update_of_deleted_file_only_invalidates() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;
    let records_before = manager.stats().await?.records;
    let removed = ids_for(&manager, "web/app.js").await?.len();

    std::fs::remove_file(dir.path().join("web/app.js"))?;
    let files = vec![SourceFile::under(dir.path(), dir.path().join("web/app.js"))];
    let job = run_job(&manager, &repo, JobType::IncrementalUpdate, files).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.files_processed, 1);
    assert_eq!(job.progress.chunks_embedded, 0);
    assert!(ids_for(&manager, "web/app.js").await?.is_empty());
    assert_eq!(manager.stats().await?.records, records_before - removed);
    Ok(())
}

#[tokio::test]
async fn test_hello_function_with_general_code_hint() -> Result<()> {
    let dir = tempdir()?;
    write(
        dir.path(),
        "hello.src",
        "function hello(name) { return \"Hello, \" + name; }\n",
    );
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;

    let file = SourceFile::under(dir.path(), dir.path().join("hello.src")).with_language("general-code");
    let job = run_job(&manager, &repo, JobType::FullIndex, vec![file]).await?;
    assert_eq!(job.status, JobStatus::Completed);

    let records = manager.store().records_for_path("hello.src").await?;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.metadata.chunk_type, ChunkType::Function);
    assert_eq!(record.metadata.function_name.as_deref(), Some("hello"));
    assert_eq!(record.metadata.language, "general-code");
    assert_eq!((record.start_line, record.end_line), (1, 1));

    let chunk = manager.store().load_chunk(record).await?;
    assert!(chunk.content.starts_with("function hello(name)"));
    Ok(())
}

#[tokio::test]
async fn test_unreadable_file_is_skipped() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    std::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00, 0x81])?;
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;

    let job = full_index(&manager, &repo, dir.path()).await?;
    assert_eq!(job.progress.files_total, 4);
    assert_eq!(job.progress.files_processed, 3);
    assert_eq!(job.progress.files_skipped, 1);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].code, "file_not_utf8");
    assert_eq!(job.errors[0].file.as_deref(), Some("blob.bin"));
    assert!(job.fatal_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_prunes_vanished_files() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;
    let kept = ids_for(&manager, "tools/report.py").await?;

    std::fs::remove_file(dir.path().join("src/lib.rs"))?;
    let job = run_job(&manager, &repo, JobType::Cleanup, discover(dir.path(), u64::MAX)).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert!(ids_for(&manager, "src/lib.rs").await?.is_empty());
    assert_eq!(ids_for(&manager, "tools/report.py").await?, kept);
    assert_eq!(manager.stats().await?.files, 2);
    Ok(())
}

#[tokio::test]
async fn test_provider_migration_replaces_vectors_in_place() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;
    let before: BTreeSet<String> = snapshot(&manager).await?.into_iter().map(|(id, _, _)| id).collect();

    manager.register_provider(Arc::new(HashingProvider::new(16)));
    let id = manager
        .start_job_with_provider(&repo.id, JobType::ProviderMigration, vec![], Some("hashing-16"))
        .await?;
    let job = manager.wait(id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.provider, "hashing-16");
    assert_eq!(job.progress.chunks_embedded, before.len());

    let records = manager.store().all_records().await?;
    let after: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
    assert_eq!(after, before);
    for record in &records {
        assert_eq!(record.metadata.provider, "hashing-16");
        assert_eq!(record.metadata.dimension, 16);
        assert_eq!(manager.store().load_vector(record).await?.len(), 16);
    }
    Ok(())
}

#[tokio::test]
async fn test_search_survives_corrupt_blob() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;

    let damaged = manager
        .store()
        .records_for_path("src/lib.rs")
        .await?
        .into_iter()
        .find(|r| r.metadata.function_name.as_deref() == Some("parse_config"))
        .unwrap();
    std::fs::write(&damaged.vector_path, b"not a vector")?;

    let hits = manager.search_text("parse config path", 10, &QueryFilter::default()).await?;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.id != damaged.id));
    assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    Ok(())
}

#[tokio::test]
async fn test_search_filters_by_language() -> Result<()> {
    let dir = tempdir()?;
    sample_repo(dir.path());
    let (manager, repo) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    full_index(&manager, &repo, dir.path()).await?;

    let hits = manager
        .search_text("build report rows", 10, &QueryFilter::new().with_language("python"))
        .await?;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.language == "python" && hit.file == "tools/report.py"));
    assert!(hits.iter().any(|hit| hit.names.contains(&"build_report".to_string())));
    Ok(())
}

#[tokio::test]
async fn test_empty_index_search() -> Result<()> {
    let dir = tempdir()?;
    let (manager, _) = open(dir.path(), fast_pipeline(3, 2), hashing()).await?;
    let hits = manager.search_text("anything", 5, &QueryFilter::default()).await?;
    assert!(hits.is_empty());
    Ok(())
}
