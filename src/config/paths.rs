//! Canonical file locations under the lectern home.
//!
//! Only the Coordination Service touches these; every other process
//! reaches the store over RPC.

use std::path::{Path, PathBuf};

/// Database file name inside the home directory
pub const DB_FILE: &str = "lectern.db";

/// Owner lock file name inside the home directory
pub const LOCK_FILE: &str = "lectern.db.lock";

/// The task database (<home>/lectern.db)
pub fn db_path(home: &Path) -> PathBuf {
    home.join(DB_FILE)
}

/// Lock held by the running service (<home>/lectern.db.lock)
pub fn lock_path(home: &Path) -> PathBuf {
    home.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_home() {
        let home = PathBuf::from("/srv/lectern");
        assert_eq!(db_path(&home), PathBuf::from("/srv/lectern/lectern.db"));
        assert_eq!(lock_path(&home), PathBuf::from("/srv/lectern/lectern.db.lock"));
    }
}
