//! Exclusion matrix: may two ticket types run concurrently on one cluster?
//!
//! The matrix is loaded once from a two-dimensional tabular source (CSV
//! export of the authoritative sheet): the first row names the
//! already-running ticket types, each following row names a candidate type
//! followed by one cell per column. A cell of `N` means the pair does *not*
//! conflict; `Y`, blank, and any unknown token all mean conflict — missing
//! knowledge defaults to the safe side.
//!
//! The matrix is **not symmetric**: `exclusive(A, B)` asks "may candidate A
//! start while B runs", which need not equal the reverse question.
//!
//! Reads are lock-free on an immutable snapshot; the admin reload
//! side-channel publishes a whole new snapshot atomically.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::ticket::TicketType;

/// An immutable exclusion matrix snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExclusionMatrix {
    /// (candidate, running) -> conflicts? Only explicit cells are stored;
    /// lookups missing from the map conflict by default.
    cells: HashMap<(String, String), bool>,
}

impl ExclusionMatrix {
    /// An empty matrix: every pair conflicts.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses the tabular source.
    ///
    /// Expected shape:
    ///
    /// ```text
    /// ,MYSQL_HA_APPLY,MYSQL_HA_FULL_BACKUP
    /// MYSQL_HA_APPLY,N,Y
    /// MYSQL_MASTER_SLAVE_SWITCH,,N
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::MatrixParse`] when a data row has more cells than the
    /// header, or the header is empty.
    pub fn parse(source: &str) -> Result<Self> {
        let mut lines = source.lines().enumerate();

        let header = loop {
            match lines.next() {
                Some((_, line)) if line.trim().is_empty() => {}
                Some((_, line)) => break line,
                None => {
                    return Err(Error::MatrixParse {
                        line: 1,
                        message: "empty matrix source".into(),
                    })
                }
            }
        };

        let running_types: Vec<String> = header
            .split(',')
            .skip(1)
            .map(|t| t.trim().to_owned())
            .collect();
        if running_types.is_empty() {
            return Err(Error::MatrixParse {
                line: 1,
                message: "header names no running ticket types".into(),
            });
        }

        let mut cells = HashMap::new();
        for (idx, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(',');
            let candidate = fields
                .next()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| Error::MatrixParse {
                    line: idx + 1,
                    message: "data row without a candidate type".into(),
                })?;

            let values: Vec<&str> = fields.map(str::trim).collect();
            if values.len() > running_types.len() {
                return Err(Error::MatrixParse {
                    line: idx + 1,
                    message: format!(
                        "row has {} cells but header names {} types",
                        values.len(),
                        running_types.len()
                    ),
                });
            }

            for (col, value) in values.iter().enumerate() {
                let conflicts = !value.eq_ignore_ascii_case("N");
                cells.insert(
                    (candidate.to_owned(), running_types[col].clone()),
                    conflicts,
                );
            }
        }

        Ok(Self { cells })
    }

    /// Returns true when `candidate` conflicts with an already-running
    /// `running` ticket type on the same cluster.
    ///
    /// Missing entries conflict (the safe default).
    #[must_use]
    pub fn exclusive(&self, candidate: TicketType, running: TicketType) -> bool {
        self.exclusive_tokens(candidate.as_token(), running.as_token())
    }

    /// Token-level lookup, for types not in the compiled enum.
    #[must_use]
    pub fn exclusive_tokens(&self, candidate: &str, running: &str) -> bool {
        self.cells
            .get(&(candidate.to_owned(), running.to_owned()))
            .copied()
            .unwrap_or(true)
    }

    /// Number of explicit cells in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if the snapshot carries no explicit cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("exclusion matrix lock poisoned")
}

/// Process-lifetime handle publishing immutable matrix snapshots.
#[derive(Debug)]
pub struct MatrixHandle {
    current: RwLock<Arc<ExclusionMatrix>>,
}

impl MatrixHandle {
    /// Creates a handle over an initial snapshot.
    #[must_use]
    pub fn new(matrix: ExclusionMatrix) -> Self {
        Self {
            current: RwLock::new(Arc::new(matrix)),
        }
    }

    /// Returns the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the handle lock is poisoned.
    pub fn snapshot(&self) -> Result<Arc<ExclusionMatrix>> {
        let guard = self.current.read().map_err(poison_err)?;
        Ok(Arc::clone(&guard))
    }

    /// Atomically publishes a new snapshot (admin reload side-channel).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the handle lock is poisoned.
    #[tracing::instrument(skip(self, matrix), fields(cells = matrix.len()))]
    pub fn reload(&self, matrix: ExclusionMatrix) -> Result<()> {
        let mut guard = self.current.write().map_err(poison_err)?;
        *guard = Arc::new(matrix);
        tracing::info!("exclusion matrix reloaded");
        Ok(())
    }
}

impl Default for MatrixHandle {
    fn default() -> Self {
        Self::new(ExclusionMatrix::empty())
    }
}
