use std::sync::Arc;
use std::thread;

use iris_indexer::index::updates::TermQuery;
use iris_indexer::index::{DeleteQuery, SegmentStore};
use iris_indexer::reader::{DocumentStoredFieldVisitor, MemoryLeafReader};
use iris_indexer::{
    Document, DocumentsWriter, Field, IndexWriterConfig, LeafReader, MemorySegmentStore,
    MergeSchedulerKind, StoredValue, Term,
};

fn doc(id: usize, body: &str) -> Document {
    let id = id.to_string();
    Document::builder()
        .add_field(Field::keyword("id", id.clone()).store(StoredValue::Text(id)))
        .add_tokens("body", body.split_whitespace())
        .build()
}

#[test]
fn test_flush_every_thousand_docs() -> iris_indexer::Result<()> {
    // 1. One thread state, flush by document count only
    let store = MemorySegmentStore::new();
    let config = IndexWriterConfig::new()
        .with_ram_buffer_size_mb(None)
        .with_max_buffered_docs(Some(1000))
        .with_max_thread_states(1);
    let writer = DocumentsWriter::new(config, Arc::new(store.clone()))?;

    // 2. Index 2500 documents
    for i in 0..2500 {
        writer.add_document(&doc(i, "the quick brown fox"))?;
    }
    assert_eq!(store.segment_names().len(), 2, "two full buffers flushed");
    assert_eq!(writer.num_buffered_docs(), 500);
    for name in store.segment_names() {
        assert_eq!(store.segment(&name).unwrap().max_doc(), 1000);
    }

    // 3. The rest goes out with the full flush
    writer.flush_all_threads()?;
    let reader = writer.open_reader()?;
    assert_eq!(reader.max_doc(), 2500);
    assert_eq!(reader.doc_freq(&Term::new("body", "fox"))?, Some(2500));
    assert_eq!(reader.total_term_freq(&Term::new("body", "the"))?, Some(2500));
    writer.close()
}

#[test]
fn test_concurrent_indexing() -> iris_indexer::Result<()> {
    let store = MemorySegmentStore::new();
    let config = IndexWriterConfig::new()
        .with_max_buffered_docs(Some(50))
        .with_max_thread_states(4);
    let writer = Arc::new(DocumentsWriter::new(config, Arc::new(store.clone()))?);

    thread::scope(|scope| {
        for t in 0..4 {
            let writer = writer.clone();
            scope.spawn(move || {
                for i in 0..250 {
                    let body = if i % 2 == 0 { "even shared" } else { "odd shared" };
                    writer.add_document(&doc(t * 1000 + i, body)).unwrap();
                }
            });
        }
    });
    writer.flush_all_threads()?;

    let reader = writer.open_reader()?;
    assert_eq!(reader.max_doc(), 1000);
    assert_eq!(reader.num_docs(), 1000);
    assert_eq!(reader.doc_freq(&Term::new("body", "shared"))?, Some(1000));
    assert_eq!(reader.doc_freq(&Term::new("body", "even"))?, Some(500));
    assert_eq!(writer.pending_num_docs(), 1000);

    let stats = writer.flush_stats();
    assert_eq!(stats.active_bytes, 0);
    assert_eq!(stats.flush_bytes, 0);
    assert_eq!(stats.num_flushing, 0);
    writer.close()
}

#[test]
fn test_updates_and_deletes_across_segments() -> iris_indexer::Result<()> {
    // 1. Setup
    let store = MemorySegmentStore::new();
    let config = IndexWriterConfig::new().with_merge_scheduler(MergeSchedulerKind::Serial);
    let writer = DocumentsWriter::new(config, Arc::new(store.clone()))?;

    // 2. Two flushed segments and one buffered
    for i in 0..10 {
        writer.add_document(&doc(i, "first"))?;
    }
    writer.flush_all_threads()?;
    for i in 10..20 {
        writer.add_document(&doc(i, "second"))?;
    }
    writer.flush_all_threads()?;
    for i in 20..30 {
        writer.add_document(&doc(i, "third"))?;
    }

    // 3. Replace a published doc, delete by term and by query
    writer.update_document(&doc(3, "replaced"), Some(Term::new("id", "3")))?;
    writer.delete_terms([Term::new("body", "second")])?;
    let query: Arc<dyn DeleteQuery> = Arc::new(TermQuery::new(Term::new("id", "25")));
    writer.delete_queries([query])?;
    // added after the delete, so it survives
    writer.add_document(&doc(40, "second"))?;
    writer.flush_all_threads()?;

    // 4. The "second" segment is gone entirely
    assert_eq!(writer.segments().len(), 2);
    let reader = writer.open_reader()?;
    // 9 left of the first segment, 11 of the buffered one
    assert_eq!(reader.num_docs(), 20);
    assert_eq!(reader.doc_freq(&Term::new("body", "replaced"))?, Some(1));

    // 5. Merging drops the deleted documents
    let target = writer.force_merge()?.expect("two segments to merge");
    assert_eq!(store.segment_names(), vec![target.clone()]);
    let merged = store.segment(&target).unwrap();
    assert_eq!(merged.max_doc(), 20);
    assert_eq!(merged.del_count(), 0);

    let leaf = MemoryLeafReader::new(merged);
    let mut ids = Vec::new();
    for doc in 0..20 {
        let mut visitor = DocumentStoredFieldVisitor::with_fields(["id"]);
        leaf.visit_stored_fields(doc, &mut visitor)?;
        if let Some((_, StoredValue::Text(id))) = visitor.fields().first() {
            ids.push(id.clone());
        }
    }
    assert!(!ids.contains(&"25".to_string()));
    assert_eq!(ids.iter().filter(|id| *id == "3").count(), 1);
    assert!(ids.contains(&"40".to_string()));
    writer.close()
}

#[test]
fn test_concurrent_updates_of_the_same_ids() -> iris_indexer::Result<()> {
    const IDS: usize = 10;

    // 1. Small buffers so updates race across thread states and flushes
    let store = MemorySegmentStore::new();
    let config = IndexWriterConfig::new()
        .with_max_buffered_docs(Some(7))
        .with_max_thread_states(8);
    let writer = Arc::new(DocumentsWriter::new(config, Arc::new(store.clone()))?);

    // 2. Eight threads replace the same few ids over and over
    thread::scope(|scope| {
        for t in 0..8 {
            let writer = writer.clone();
            scope.spawn(move || {
                for i in 0..200 {
                    let id = (t + i) % IDS;
                    let term = Term::new("id", id.to_string());
                    writer
                        .update_document(&doc(id, &format!("thread{t} round{i}")), Some(term))
                        .unwrap();
                }
            });
        }
    });
    writer.flush_all_threads()?;

    // 3. Exactly one live document per id
    let reader = writer.open_reader()?;
    assert_eq!(reader.num_docs() as usize, IDS);
    let mut live = vec![0; IDS];
    for entry in writer.segments() {
        let segment = store.segment(&entry.name).unwrap();
        let leaf = MemoryLeafReader::new(segment.clone());
        for doc in 0..segment.max_doc() {
            if segment.is_deleted(doc) {
                continue;
            }
            let mut visitor = DocumentStoredFieldVisitor::with_fields(["id"]);
            leaf.visit_stored_fields(doc, &mut visitor)?;
            if let Some((_, StoredValue::Text(id))) = visitor.fields().first() {
                live[id.parse::<usize>().unwrap()] += 1;
            }
        }
    }
    assert_eq!(live, vec![1; IDS]);
    writer.close()
}

#[test]
fn test_doc_values_with_holes_and_updates() -> iris_indexer::Result<()> {
    let store = MemorySegmentStore::new();
    let writer = DocumentsWriter::new(IndexWriterConfig::new(), Arc::new(store.clone()))?;

    // 1. Only every other document carries values
    for i in 0..6 {
        let mut builder = Document::builder().add_keyword("id", i.to_string());
        if i % 2 == 0 {
            builder = builder
                .add_numeric("price", i as i64 * 10)
                .add_binary("payload", vec![i as u8; 3]);
        }
        writer.add_document(&builder.build())?;
    }
    writer.flush_all_threads()?;

    let name = writer.segments()[0].name.clone();
    let segment = store.segment(&name).unwrap();
    let price = segment.field("price").unwrap().numeric.clone().unwrap();
    assert_eq!(price, vec![Some(0), None, Some(20), None, Some(40), None]);
    let payload = segment.field("payload").unwrap().binary.clone().unwrap();
    assert_eq!(payload[1], None);
    assert_eq!(payload[4], Some(vec![4, 4, 4]));

    // 2. Update a value, clear another
    writer.update_numeric_doc_value(Term::new("id", "2"), "price", Some(99))?;
    writer.update_numeric_doc_value(Term::new("id", "4"), "price", None)?;
    writer.update_binary_doc_value(Term::new("id", "0"), "payload", Some(b"new".to_vec()))?;
    writer.apply_all_deletes()?;

    let leaf = store.open_leaf(&name)?;
    assert_eq!(leaf.num_docs(), 6);
    let segment = store.segment(&name).unwrap();
    let price = segment.field("price").unwrap().numeric.clone().unwrap();
    assert_eq!(price, vec![Some(0), None, Some(99), None, None, None]);
    let payload = segment.field("payload").unwrap().binary.clone().unwrap();
    assert_eq!(payload[0], Some(b"new".to_vec()));
    writer.close()
}

#[test]
fn test_rejected_documents_do_not_poison_the_buffer() -> iris_indexer::Result<()> {
    let store = MemorySegmentStore::new();
    let writer = DocumentsWriter::new(IndexWriterConfig::new(), Arc::new(store.clone()))?;
    writer.add_document(&doc(0, "kept"))?;

    let huge = Document::builder()
        .add_keyword("id", "x".repeat(40_000))
        .build();
    let err = writer.add_document(&huge).unwrap_err();
    assert!(matches!(err, iris_indexer::IrisError::Capacity(_)));

    writer.add_document(&doc(1, "kept"))?;
    writer.flush_all_threads()?;
    let reader = writer.open_reader()?;
    assert_eq!(reader.max_doc(), 2);
    assert_eq!(reader.doc_freq(&Term::new("body", "kept"))?, Some(2));
    writer.close()
}
