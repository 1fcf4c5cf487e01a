//! In-memory read store.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use super::{ReadStore, StudentRow};
use crate::event::StudentId;

#[derive(Debug, Default)]
struct Inner {
    students: HashMap<StudentId, StudentRow>,
    codes: HashMap<String, StudentId>,
}

/// In-memory [`ReadStore`]. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of student rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("read store lock poisoned")
            .students
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows, ordered by id.
    #[must_use]
    pub fn rows(&self) -> Vec<StudentRow> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .expect("read store lock poisoned")
            .students
            .values()
            .cloned()
            .collect();
        rows.sort_unstable_by_key(|row| row.id);
        rows
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lookup code `{code}` already belongs to student {owner}")]
    CodeTaken { code: String, owner: StudentId },
}

impl ReadStore for Store {
    type Error = Error;

    fn upsert_student<'a>(
        &'a self,
        row: &'a StudentRow,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let mut inner = self.inner.write().expect("read store lock poisoned");
        match inner.students.get(&row.id) {
            Some(existing) if existing.version > row.version => {
                tracing::trace!(
                    aggregate_id = %row.id,
                    stored = existing.version,
                    offered = row.version,
                    "skipping stale row"
                );
            }
            _ => {
                inner.students.insert(row.id, row.clone());
            }
        }
        drop(inner);
        std::future::ready(Ok(()))
    }

    fn insert_lookup_code<'a>(
        &'a self,
        code: &'a str,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let mut inner = self.inner.write().expect("read store lock poisoned");
        let result = match inner.codes.get(code) {
            Some(owner) if owner != id => Err(Error::CodeTaken {
                code: code.to_string(),
                owner: *owner,
            }),
            Some(_) => Ok(()),
            None => {
                inner.codes.insert(code.to_string(), *id);
                Ok(())
            }
        };
        drop(inner);
        std::future::ready(result)
    }

    fn get_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<StudentRow>, Self::Error>> + Send + 'a {
        let row = self
            .inner
            .read()
            .expect("read store lock poisoned")
            .students
            .get(id)
            .cloned();
        std::future::ready(Ok(row))
    }

    fn find_by_lookup_code<'a>(
        &'a self,
        code: &'a str,
    ) -> impl Future<Output = Result<Option<StudentId>, Self::Error>> + Send + 'a {
        let id = self
            .inner
            .read()
            .expect("read store lock poisoned")
            .codes
            .get(code)
            .copied();
        std::future::ready(Ok(id))
    }
}
