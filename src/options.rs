//! Persisted per-package options (pin/new/orphan) and the set of every
//! package name seen so far, stored in SQLite.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::Result;

/// User flags stored for one package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageFlags {
    pub pinned: bool,
    pub new: bool,
    pub orphaned: bool,
}

impl PackageFlags {
    fn is_empty(&self) -> bool {
        !(self.pinned || self.new || self.orphaned)
    }
}

/// Every package name the lister has ever loaded.
///
/// Owned by the lister and threaded through each cache open so "new"
/// detection does not depend on process-wide state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownPackages {
    names: HashSet<String>,
    /// False until the first full cache load has been recorded
    seeded: bool,
}

impl KnownPackages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Record `name`; returns true if it was not known before
    pub fn insert(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn mark_seeded(&mut self) {
        self.seeded = true;
    }
}

/// SQLite-backed options storage
pub struct OptionsStore {
    conn: Connection,
}

impl OptionsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        debug!(path = %path.display(), "opened options database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS package_flags (
                name     TEXT PRIMARY KEY,
                pinned   INTEGER NOT NULL DEFAULT 0,
                new      INTEGER NOT NULL DEFAULT 0,
                orphaned INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS known_packages (
                name TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    // ========================================================================
    // Flags
    // ========================================================================

    pub fn flags(&self, name: &str) -> Result<PackageFlags> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT pinned, new, orphaned FROM package_flags WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(PackageFlags {
                pinned: row.get(0)?,
                new: row.get(1)?,
                orphaned: row.get(2)?,
            }),
            None => Ok(PackageFlags::default()),
        }
    }

    /// Every package with at least one flag set
    pub fn all_flags(&self) -> Result<HashMap<String, PackageFlags>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, pinned, new, orphaned FROM package_flags")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PackageFlags {
                    pinned: row.get(1)?,
                    new: row.get(2)?,
                    orphaned: row.get(3)?,
                },
            ))
        })?;

        let mut flags = HashMap::new();
        for row in rows {
            let (name, f) = row?;
            flags.insert(name, f);
        }
        Ok(flags)
    }

    pub fn set_flags(&self, name: &str, flags: PackageFlags) -> Result<()> {
        if flags.is_empty() {
            self.conn
                .execute("DELETE FROM package_flags WHERE name = ?1", params![name])?;
        } else {
            self.conn.execute(
                "INSERT INTO package_flags (name, pinned, new, orphaned) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                     pinned = excluded.pinned, new = excluded.new, orphaned = excluded.orphaned",
                params![name, flags.pinned, flags.new, flags.orphaned],
            )?;
        }
        Ok(())
    }

    pub fn set_pinned(&self, name: &str, pinned: bool) -> Result<()> {
        let flags = self.flags(name)?;
        self.set_flags(name, PackageFlags { pinned, ..flags })
    }

    pub fn set_new(&self, name: &str, new: bool) -> Result<()> {
        let flags = self.flags(name)?;
        self.set_flags(name, PackageFlags { new, ..flags })
    }

    pub fn set_orphaned(&self, name: &str, orphaned: bool) -> Result<()> {
        let flags = self.flags(name)?;
        self.set_flags(name, PackageFlags { orphaned, ..flags })
    }

    /// Clear the "new" flag on every package
    pub fn forget_new(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute("UPDATE package_flags SET new = 0 WHERE new = 1", [])?;
        self.conn.execute(
            "DELETE FROM package_flags WHERE pinned = 0 AND new = 0 AND orphaned = 0",
            [],
        )?;
        Ok(changed)
    }

    // ========================================================================
    // Known packages
    // ========================================================================

    pub fn load_known(&self) -> Result<KnownPackages> {
        let mut known = KnownPackages::new();
        let mut stmt = self.conn.prepare("SELECT name FROM known_packages")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in rows {
            known.insert(&name?);
        }

        let seeded: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'known_seeded'", [], |row| row.get(0))
            .optional()?;
        if seeded.is_some() {
            known.mark_seeded();
        }
        Ok(known)
    }

    /// Persist names added since the last save
    pub fn save_known<'a>(&mut self, names: impl IntoIterator<Item = &'a str>, seeded: bool) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut added = 0usize;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO known_packages (name) VALUES (?1)")?;
            for name in names {
                added += stmt.execute(params![name])?;
            }
            if seeded {
                tx.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('known_seeded', '1')",
                    [],
                )?;
            }
        }
        tx.commit()?;
        if added > 0 {
            info!(added, "recorded newly seen packages");
        }
        Ok(())
    }
}
