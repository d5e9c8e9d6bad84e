//! Index lifecycle tests over real files in a temp directory, using the
//! hash embedder in place of a downloaded model.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::fakes::{console_docs, HashEmbedder};
use crate::retrieval::{
    ingest, IndexDecision, IndexError, IndexLifecycle, IndexOutcome, IndexPaths, RetrievalError,
    RetrievalService,
};

const RATE_LIMIT_HTML: &str = r#"<html><head><title>Rate limiting</title></head><body>
    <h1>Rate limiting policy</h1>
    <p>Open the gateway, select Policies and add a rate limiting policy.</p>
    <ul><li>Requests per second</li><li>Burst size</li></ul>
    </body></html>"#;

const JWT_HTML: &str = r#"<html><head><title>JWT</title></head><body>
    <h1>JWT authentication</h1><p>Configure issuers and audiences.</p>
    </body></html>"#;

struct Fixture {
    _dir: tempfile::TempDir,
    source_dir: PathBuf,
    paths: IndexPaths,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source_dir = dir.path().join("docs");
    std::fs::create_dir_all(source_dir.join("gateway")).unwrap();
    std::fs::write(source_dir.join("gateway/rate-limit.html"), RATE_LIMIT_HTML).unwrap();
    std::fs::write(source_dir.join("jwt.HTM"), JWT_HTML).unwrap();

    let paths = IndexPaths::new(
        dir.path().join("documents.json"),
        dir.path().join("vectors.bin"),
    );
    Fixture {
        _dir: dir,
        source_dir,
        paths,
    }
}

fn lifecycle(fx: &Fixture, embedder: HashEmbedder) -> IndexLifecycle {
    IndexLifecycle::new(fx.source_dir.clone(), fx.paths.clone(), 120, 20, Arc::new(embedder))
}

fn set_mtime(path: &Path, time: SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

#[test]
fn test_first_run_rebuilds_then_loads() {
    let fx = fixture();
    let lc = lifecycle(&fx, HashEmbedder::new());

    assert_eq!(lc.check(), IndexDecision::Rebuild);
    let (built, outcome) = lc.ensure().unwrap();
    assert!(matches!(outcome, IndexOutcome::Rebuilt { documents } if documents == built.len()));
    assert!(fx.paths.exist());

    assert_eq!(lc.check(), IndexDecision::Load);
    let (loaded, outcome) = lc.ensure().unwrap();
    assert_eq!(outcome, IndexOutcome::Loaded { documents: built.len() });
    assert_eq!(loaded.documents(), built.documents());
}

#[test]
fn test_touching_sources_controls_staleness() {
    let fx = fixture();
    let lc = lifecycle(&fx, HashEmbedder::new());
    lc.ensure().unwrap();

    let built_at = fx.paths.mtime().unwrap();
    let source = fx.source_dir.join("gateway/rate-limit.html");

    set_mtime(&source, built_at + Duration::from_secs(60));
    assert_eq!(lc.check(), IndexDecision::Rebuild);

    set_mtime(&source, built_at - Duration::from_secs(60));
    set_mtime(&fx.source_dir.join("jwt.HTM"), built_at - Duration::from_secs(60));
    assert_eq!(lc.check(), IndexDecision::Load);
}

#[test]
fn test_unrecognized_files_do_not_count() {
    let fx = fixture();
    let lc = lifecycle(&fx, HashEmbedder::new());
    lc.ensure().unwrap();

    let notes = fx.source_dir.join("notes.txt");
    std::fs::write(&notes, "scratch").unwrap();
    set_mtime(&notes, fx.paths.mtime().unwrap() + Duration::from_secs(600));
    assert_eq!(lc.check(), IndexDecision::Load);
}

#[test]
fn test_no_sources_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let paths = IndexPaths::new(dir.path().join("d.json"), dir.path().join("v.bin"));
    let lc = IndexLifecycle::new(
        dir.path().join("missing"),
        paths.clone(),
        100,
        10,
        Arc::new(HashEmbedder::new()),
    );

    assert!(matches!(lc.ensure(), Err(RetrievalError::NoSourceContent(_))));
    assert!(!paths.exist());
}

#[test]
fn test_failed_rebuild_keeps_previous_index() {
    let fx = fixture();
    let service = RetrievalService::new(
        Arc::new(HashEmbedder::new()),
        lifecycle(&fx, HashEmbedder::new()),
    );
    service.initialize().unwrap();
    let before = service.current().unwrap();
    let documents_bytes = std::fs::read(&fx.paths.documents).unwrap();
    let vectors_bytes = std::fs::read(&fx.paths.vectors).unwrap();

    set_mtime(
        &fx.source_dir.join("jwt.HTM"),
        fx.paths.mtime().unwrap() + Duration::from_secs(60),
    );
    let broken = RetrievalService::new(
        Arc::new(HashEmbedder::failing()),
        lifecycle(&fx, HashEmbedder::failing()),
    );
    broken.install(before.as_ref().clone());

    let err = broken.initialize().unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::IndexBuild(IndexError::Embedding(_))
    ));

    assert_eq!(std::fs::read(&fx.paths.documents).unwrap(), documents_bytes);
    assert_eq!(std::fs::read(&fx.paths.vectors).unwrap(), vectors_bytes);
    assert_eq!(broken.current().unwrap().len(), before.len());
}

#[test]
fn test_html_is_preferred_over_pdf() {
    let fx = fixture();
    std::fs::write(fx.source_dir.join("manual.pdf"), b"%PDF-1.4 not really").unwrap();

    let scan = ingest::scan(&fx.source_dir);
    assert_eq!(scan.pdf.len(), 1);
    let (format, files) = scan.preferred().unwrap();
    assert_eq!(format, ingest::SourceFormat::Html);
    assert_eq!(files.len(), 2);

    let (index, _) = lifecycle(&fx, HashEmbedder::new()).ensure().unwrap();
    assert!(index
        .documents()
        .iter()
        .all(|c| !c.source_id.ends_with(".pdf")));
}

#[test]
fn test_search_survives_persist_and_load() {
    let fx = fixture();
    let embedder = HashEmbedder::new();
    let lc = lifecycle(&fx, HashEmbedder::new());
    let (built, _) = lc.ensure().unwrap();
    let (loaded, outcome) = lc.ensure().unwrap();
    assert!(matches!(outcome, IndexOutcome::Loaded { .. }));

    let query = "how to add a rate limiting policy";
    assert_eq!(
        built.search(&embedder, query, 3).unwrap(),
        loaded.search(&embedder, query, 3).unwrap()
    );
}

#[test]
fn test_service_search_contract() {
    let docs = console_docs();
    let results = docs.search("rate limiting policy", 5);
    assert!(!results.is_empty() && results.len() <= 5);
    assert!(results
        .windows(2)
        .all(|w| w[0].distance <= w[1].distance));
    assert_eq!(results[0].document.source_id, "gateway/rate-limit.html");

    assert_eq!(docs.search("rate limiting policy", 1).len(), 1);
}

#[test]
fn test_unbuilt_index_searches_empty() {
    let service = RetrievalService::empty(Arc::new(HashEmbedder::new()));
    assert!(!service.is_ready());
    assert!(service.search("anything", 5).is_empty());
    assert_eq!(service.snippets("anything", 5), "");
}

#[test]
fn test_chunk_sources_are_relative_paths() {
    let fx = fixture();
    let (index, _) = lifecycle(&fx, HashEmbedder::new()).ensure().unwrap();
    let sources: Vec<&str> = index.documents().iter().map(|c| c.source_id.as_str()).collect();
    assert!(sources.contains(&"gateway/rate-limit.html"));
    assert!(index
        .documents()
        .iter()
        .any(|c| c.text.to_lowercase().contains("rate limiting")));
}
