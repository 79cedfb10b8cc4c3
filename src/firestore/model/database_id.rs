use std::fmt::{Display, Formatter};

use crate::firestore::constants::DEFAULT_DATABASE_ID;
use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    /// Parses `projects/{project}/databases/{database}`.
    pub fn from_name(name: &str) -> FirestoreResult<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        match segments.as_slice() {
            ["projects", project, "databases", database] if !project.is_empty() && !database.is_empty() => {
                Ok(Self::new(*project, *database))
            }
            _ => Err(invalid_argument(format!("Invalid database name: {name}"))),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Key prefix for persisted caches shared by every user of this database.
    pub fn persistence_key(&self) -> String {
        format!("{}/{}", self.project_id, self.database)
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/databases/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_parses_name() {
        let db = DatabaseId::default("project");
        assert!(db.is_default_database());
        assert_eq!(db.to_string(), "projects/project/databases/(default)");
        assert_eq!(DatabaseId::from_name(&db.to_string()).unwrap(), db);
        assert_eq!(db.persistence_key(), "project/(default)");
    }

    #[test]
    fn rejects_malformed_name() {
        let err = DatabaseId::from_name("projects/p").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
