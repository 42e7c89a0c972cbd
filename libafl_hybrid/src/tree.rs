//! On disk snapshots of the union table of a trace, the trace tree.
//!
//! The scheduler asks for a branch of a trace long after the trace ended, so the union table is
//! written to `<tree_dir>/tree<qid>/id:NNNNNN` and reloaded on request.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{
    fs::write_file_atomic,
    union_table::{Label, UnionTable, LABEL_INFO_SIZE},
    Error,
};

/// Snapshot ids wrap at this value
pub const TREE_ID_MODULUS: u32 = 1_000_000;

/// The name of a queue entry or snapshot with this id, `id:NNNNNN`
#[must_use]
pub fn entry_name(id: u32) -> String {
    format!("id:{:06}", id % TREE_ID_MODULUS)
}

/// Directory of trace tree snapshots
#[derive(Debug, Clone)]
pub struct TreeStore {
    root: PathBuf,
}

impl TreeStore {
    /// Snapshots below `root`
    #[must_use]
    pub fn new<P>(root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { root: root.into() }
    }

    /// The root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the snapshot of trace `tid` from queue `qid`
    #[must_use]
    pub fn path(&self, qid: u32, tid: u32) -> PathBuf {
        self.root.join(format!("tree{qid}")).join(entry_name(tid))
    }

    /// Snapshot labels `0..=max_label` of `table`, at most up to its last stored label.
    pub fn save(
        &self,
        qid: u32,
        tid: u32,
        table: &UnionTable,
        max_label: Label,
    ) -> Result<PathBuf, Error> {
        let path = self.path(qid, tid);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let bytes = table.dump(max_label)?;
        write_file_atomic(&path, &bytes)?;
        log::debug!(
            "Saved trace tree with {} labels to {}",
            bytes.len() / LABEL_INFO_SIZE,
            path.display()
        );
        Ok(path)
    }

    /// Load a snapshot into `table`, returns its largest label.
    ///
    /// Missing, unreadable and truncated snapshots all are [`Error::StaleSnapshot`].
    pub fn load(&self, qid: u32, tid: u32, table: &mut UnionTable) -> Result<Label, Error> {
        let path = self.path(qid, tid);
        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::stale_snapshot(format!("{} is missing", path.display())),
            _ => Error::stale_snapshot(format!("{} is unreadable: {err}", path.display())),
        })?;
        table.load(&bytes).map_err(|err| {
            Error::stale_snapshot(format!("{} is malformed: {err}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        tree::{entry_name, TreeStore},
        union_table::{LabelInfo, Operation, UnionTable, LABEL_INFO_SIZE},
        Error,
    };

    #[test]
    fn test_paths() {
        let store = TreeStore::new("/trees");
        assert_eq!(entry_name(42), "id:000042");
        assert_eq!(entry_name(1_000_042), "id:000042");
        assert_eq!(
            store.path(1, 42).to_str().unwrap(),
            "/trees/tree1/id:000042"
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::new(dir.path());

        let mut table = UnionTable::new();
        table.set(1, LabelInfo::input(0)).unwrap();
        table.set(2, LabelInfo::input(1)).unwrap();
        table
            .set(3, LabelInfo::new(Operation::Add, 8, 1, 2, 0, 0))
            .unwrap();
        let path = store.save(0, 7, &table, 3).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 4 * LABEL_INFO_SIZE as u64);

        let mut loaded = UnionTable::new();
        assert_eq!(store.load(0, 7, &mut loaded).unwrap(), 3);
        assert_eq!(loaded.resolve(3).unwrap().l2, 2);
    }

    #[test]
    fn test_stale_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::new(dir.path());
        let mut table = UnionTable::new();

        assert!(matches!(
            store.load(0, 9, &mut table),
            Err(Error::StaleSnapshot(..))
        ));

        let path = store.path(0, 9);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, [0; LABEL_INFO_SIZE + 3]).unwrap();
        assert!(matches!(
            store.load(0, 9, &mut table),
            Err(Error::StaleSnapshot(..))
        ));
    }
}
