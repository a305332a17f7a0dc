use ph_adapters::{MemorySource, SourceFilter, SourceReader};
use ph_core::Cursor;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/businesses/sample.json")
}

#[tokio::test]
async fn sample_fixture_pages_by_id() {
    let source = MemorySource::from_json_file(fixture_path()).expect("fixture loads");

    let first = source.read_page(5, &Cursor::ById { after: None }).await.unwrap();
    assert_eq!(first.records.len(), 5);
    assert!(!first.is_last(5));

    let second = source.read_page(5, &first.next_cursor).await.unwrap();
    assert_eq!(second.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![6, 7]);
    assert!(second.is_last(5));
}

#[tokio::test]
async fn active_only_filter_drops_soft_deleted_rows() {
    let source = MemorySource::from_json_file(fixture_path())
        .expect("fixture loads")
        .with_filter(SourceFilter {
            active_only: true,
            ..Default::default()
        });

    let page = source.read_page(50, &Cursor::ById { after: None }).await.unwrap();
    assert!(page.records.iter().all(|r| r.id != 7));
    assert_eq!(page.records.len(), 6);
}
