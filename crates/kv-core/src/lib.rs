//! Transactional key-value storage interface.
//!
//! The engine persists all durable job state through the narrow traits in
//! this crate. A [`Database`] hands out short-lived read snapshots and
//! single-writer transactions; the [`with_reader`] and [`with_read_writer`]
//! helpers wrap the closure-scoped usage pattern. Values are opaque bytes;
//! [`get_typed`]/[`set_typed`] layer serde_json on top for self-describing
//! records.

mod memory;

pub use memory::MemoryDatabase;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from key-value storage.
#[derive(Debug, Error)]
pub enum KvError {
    /// Key does not exist.
    #[error("key {0:?} not found")]
    NotFound(String),

    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl KvError {
    /// Returns true for the missing-key case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Read access to a consistent snapshot.
pub trait Reader {
    /// Fetch the value stored at `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
}

/// Read-write access within a transaction.
///
/// Mutations are not visible outside the transaction until it commits.
pub trait ReadWriter: Reader {
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
    fn delete(&mut self, key: &str) -> Result<(), KvError>;
}

/// A transactional key-value database.
///
/// Implementations must invoke the callback exactly once. A read-writer
/// callback that returns `Ok` commits its mutations atomically; an `Err`
/// discards them. At most one read-writer transaction runs at a time.
pub trait Database: Send + Sync {
    fn with_reader(
        &self,
        f: &mut dyn FnMut(&dyn Reader) -> Result<(), KvError>,
    ) -> Result<(), KvError>;

    fn with_read_writer(
        &self,
        f: &mut dyn FnMut(&mut dyn ReadWriter) -> Result<(), KvError>,
    ) -> Result<(), KvError>;
}

/// Run `f` against a read snapshot, with an arbitrary caller error type.
pub fn with_reader<T, E, F>(db: &dyn Database, f: F) -> Result<T, E>
where
    F: FnOnce(&dyn Reader) -> Result<T, E>,
    E: From<KvError>,
{
    let mut f = Some(f);
    let mut out: Option<Result<T, E>> = None;
    db.with_reader(&mut |r| {
        out = Some(f.take().expect("reader callback invoked once")(r));
        Ok(())
    })
    .map_err(E::from)?;
    out.expect("reader callback was invoked")
}

/// Run `f` inside a read-write transaction, with an arbitrary caller error
/// type. The transaction commits only when `f` returns `Ok`.
pub fn with_read_writer<T, E, F>(db: &dyn Database, f: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn ReadWriter) -> Result<T, E>,
    E: From<KvError>,
{
    let mut f = Some(f);
    let mut out: Option<Result<T, E>> = None;
    db.with_read_writer(&mut |rw| {
        match f.take().expect("writer callback invoked once")(rw) {
            Ok(v) => {
                out = Some(Ok(v));
                Ok(())
            }
            Err(e) => {
                out = Some(Err(e));
                // Surface an error so the transaction rolls back.
                Err(KvError::Storage("transaction aborted by caller".into()))
            }
        }
    })
    .or_else(|e| match &out {
        // The abort above carried the caller's error; report that instead.
        Some(Err(_)) => Ok(()),
        _ => Err(E::from(e)),
    })?;
    out.expect("writer callback was invoked")
}

/// Decode the serde_json record stored at `key`.
///
/// A missing key is `KvError::NotFound`.
pub fn get_typed<T: DeserializeOwned>(r: &dyn Reader, key: &str) -> Result<T, KvError> {
    let data = r
        .get(key)?
        .ok_or_else(|| KvError::NotFound(key.to_string()))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Encode `value` as serde_json and store it at `key`.
pub fn set_typed<T: Serialize>(rw: &mut dyn ReadWriter, key: &str, value: &T) -> Result<(), KvError> {
    let data = serde_json::to_vec(value)?;
    rw.set(key, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u64,
    }

    #[test]
    fn test_typed_roundtrip() {
        let db = MemoryDatabase::new();
        let rec = Record {
            name: "job-1".into(),
            count: 7,
        };

        db.with_read_writer(&mut |rw| set_typed(rw, "/records/1", &rec))
            .unwrap();

        db.with_reader(&mut |r| {
            let got: Record = get_typed(r, "/records/1")?;
            assert_eq!(got, rec);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_get_typed_not_found() {
        let db = MemoryDatabase::new();
        db.with_reader(&mut |r| {
            let err = get_typed::<Record>(r, "/missing").unwrap_err();
            assert!(err.is_not_found());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_generic_helpers_propagate_caller_error() {
        #[derive(Debug, thiserror::Error)]
        enum AppError {
            #[error("kv: {0}")]
            Kv(#[from] KvError),
            #[error("boom")]
            Boom,
        }

        let db = MemoryDatabase::new();

        // A caller error rolls the transaction back.
        let res: Result<(), AppError> = with_read_writer(&db, |rw| {
            rw.set("/k", b"v".to_vec())?;
            Err(AppError::Boom)
        });
        assert!(matches!(res, Err(AppError::Boom)));

        let found: Result<bool, AppError> = with_reader(&db, |r| Ok(r.get("/k")?.is_some()));
        assert!(!found.unwrap());
    }

    #[test]
    fn test_generic_helpers_commit_on_ok() {
        let db = MemoryDatabase::new();
        let () = with_read_writer::<_, KvError, _>(&db, |rw| rw.set("/k", b"v".to_vec())).unwrap();
        let got: Vec<u8> = with_reader::<_, KvError, _>(&db, |r| {
            Ok(r.get("/k")?.expect("key must exist"))
        })
        .unwrap();
        assert_eq!(got, b"v");
    }
}
