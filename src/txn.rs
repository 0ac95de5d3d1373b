use crate::error::{Result, StoreError};
use std::cell::Cell;

/// Depth-counted transaction coordinator over one connection.
///
/// The outermost level is a real `BEGIN`/`COMMIT`; nested levels map to
/// savepoints so that multi-statement internal operations (schema rewrites,
/// table deletion) stay atomic whether or not the caller already opened a
/// transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnCoordinator {
    depth: Cell<u32>,
}

impl TxnCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.depth.get() > 0
    }

    pub(crate) fn soft_begin(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            conn.execute_batch("BEGIN")?;
        } else {
            conn.execute_batch(&format!("SAVEPOINT fp_savepoint_{depth}"))?;
        }
        self.depth.set(depth + 1);
        Ok(())
    }

    /// Release the innermost level. The caller is responsible for running its
    /// commit-time work *before* the outermost release.
    pub(crate) fn soft_commit(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        match depth {
            0 => {
                return Err(StoreError::Message(
                    "commit without an open transaction".to_string(),
                ));
            }
            1 => conn.execute_batch("COMMIT")?,
            _ => conn.execute_batch(&format!("RELEASE SAVEPOINT fp_savepoint_{}", depth - 1))?,
        }
        self.depth.set(depth - 1);
        Ok(())
    }

    pub(crate) fn soft_rollback(&self, conn: &rusqlite::Connection) -> Result<()> {
        let depth = self.depth.get();
        match depth {
            0 => {
                return Err(StoreError::Message(
                    "rollback without an open transaction".to_string(),
                ));
            }
            1 => conn.execute_batch("ROLLBACK")?,
            _ => {
                let name = format!("fp_savepoint_{}", depth - 1);
                conn.execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
                ))?;
            }
        }
        self.depth.set(depth - 1);
        Ok(())
    }
}
