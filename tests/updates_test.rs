use std::sync::Arc;

use iris_indexer::Term;
use iris_indexer::index::updates::TermQuery;
use iris_indexer::index::{BufferedUpdatesStream, DeleteQuery, FrozenBufferedUpdates};

#[test]
fn test_coalesced_terms_come_out_sorted() {
    let stream = BufferedUpdatesStream::new();
    stream.push(FrozenBufferedUpdates::from_terms([
        Term::new("id", "d"),
        Term::new("id", "a"),
    ]));
    let base = stream.push(FrozenBufferedUpdates::from_terms([Term::new("body", "z")]));
    stream.push(FrozenBufferedUpdates::from_terms([
        Term::new("id", "c"),
        Term::new("id", "a"),
    ]));
    let query: Arc<dyn DeleteQuery> = Arc::new(TermQuery::new(Term::new("id", "q")));
    stream.push(FrozenBufferedUpdates::from_queries([query.clone(), query]));

    // 1. Everything
    let all = stream.coalesce(0);
    let terms: Vec<String> = all.terms_iterable().map(|t| t.to_string()).collect();
    assert_eq!(terms, vec!["body:z", "id:a", "id:a", "id:c", "id:d"]);
    assert!(terms.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(all.total_term_count(), 5);
    // the same query twice collapses to one
    assert_eq!(all.queries_iterable().count(), 1);

    // 2. Only packets newer than a segment's generation
    let newer = stream.coalesce(base);
    let terms: Vec<String> = newer.terms_iterable().map(|t| t.to_string()).collect();
    assert_eq!(terms, vec!["id:a", "id:c"]);

    // 3. Nothing left once every segment is past the last generation
    stream.prune(stream.last_gen());
    assert!(!stream.any());
    assert!(!stream.coalesce(0).any());
}
