//! Lazy, restartable queries over a collection.

use crate::error::StoreResult;
use crate::local_store::LocalStore;
use crate::schema::{Record, RecordKey};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Record filter evaluated against the JSON body.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A query over one collection. Nothing is read until [`Query::stream`] is
/// polled; every call to `stream` starts again from the first record.
#[derive(Clone)]
pub struct Query {
    store: LocalStore,
    collection: String,
    predicate: Predicate,
    page_size: usize,
}

struct Cursor {
    store: LocalStore,
    collection: String,
    predicate: Predicate,
    page_size: usize,
    after: Option<RecordKey>,
    buffered: VecDeque<Record>,
    exhausted: bool,
}

impl Query {
    pub(crate) fn new(store: LocalStore, collection: String, predicate: Predicate, page_size: usize) -> Self {
        Self {
            store,
            collection,
            predicate,
            page_size: page_size.max(1),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Streams matching records in key order, one page at a time. The stream
    /// ends after the last page or after the first error.
    pub fn stream(&self) -> BoxStream<'static, StoreResult<Record>> {
        let cursor = Cursor {
            store: self.store.clone(),
            collection: self.collection.clone(),
            predicate: self.predicate.clone(),
            page_size: self.page_size,
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffered.pop_front() {
                    return Some((Ok(record), cursor));
                }
                if cursor.exhausted {
                    return None;
                }
                match cursor
                    .store
                    .page_after(&cursor.collection, cursor.after.clone(), cursor.page_size)
                    .await
                {
                    Ok(page) => {
                        cursor.exhausted = page.len() < cursor.page_size;
                        if let Some(last) = page.last() {
                            cursor.after = Some(last.key.clone());
                        }
                        let predicate = cursor.predicate.clone();
                        cursor
                            .buffered
                            .extend(page.into_iter().filter(|r| predicate(&r.body)));
                    }
                    Err(e) => {
                        cursor.exhausted = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
        .boxed()
    }

    /// Collects every matching record.
    pub async fn collect_all(&self) -> StoreResult<Vec<Record>> {
        self.stream().try_collect().await
    }

    /// Counts matching records without keeping them.
    pub async fn count(&self) -> StoreResult<usize> {
        self.stream()
            .try_fold(0usize, |n, _| async move { Ok(n + 1) })
            .await
    }
}
