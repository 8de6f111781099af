//! SurrealDB access for the pipeline.
//!
//! One connection serves both the home (bookkeeping) database and every
//! knowledge base's graph database. [`KgStore::within`] is the only way to run
//! statements: it switches the connection to the requested namespace and
//! database, runs the body and restores the previous context afterwards,
//! whether the body succeeded or not.

pub mod schema;
pub mod tasks;

use std::future::Future;
use std::sync::Arc;

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::kg::error::Result;

/// A namespace/database pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbTarget {
    pub namespace: String,
    pub database: String,
}

impl DbTarget {
    pub fn new(namespace: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for DbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.database)
    }
}

/// Shared handle on the store.
///
/// Cloning is cheap; clones share the connection and the context lock.
#[derive(Clone)]
pub struct KgStore {
    db: Surreal<Any>,
    home: DbTarget,
    current: Arc<Mutex<DbTarget>>,
}

impl std::fmt::Debug for KgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KgStore").field("home", &self.home).finish()
    }
}

impl KgStore {
    /// Connect using a `surrealdb` connection string and select the home database.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let db = connect(cfg.url.as_str()).await?;

        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        let home = DbTarget::new(&cfg.namespace, &cfg.database);
        db.use_ns(home.namespace.as_str())
            .use_db(home.database.as_str())
            .await?;

        info!(url = %cfg.url, home = %home, "Connected to SurrealDB");

        let store = Self {
            db,
            current: Arc::new(Mutex::new(home.clone())),
            home,
        };
        schema::ensure_home_schema(&store).await?;
        Ok(store)
    }

    /// In-memory store, for tests and ephemeral runs.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self> {
        Self::connect(&StoreConfig {
            url: "mem://".to_string(),
            namespace: namespace.to_string(),
            database: database.to_string(),
            username: None,
            password: None,
        })
        .await
    }

    pub fn home_target(&self) -> &DbTarget {
        &self.home
    }

    /// Run `body` against `target`, restoring the previous context afterwards.
    ///
    /// The context lock is held for the whole body, so keep model and
    /// embedding calls outside.
    pub async fn within<F, Fut, T>(&self, target: &DbTarget, body: F) -> Result<T>
    where
        F: FnOnce(Surreal<Any>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut current = self.current.lock().await;
        let prior = current.clone();

        if *current != *target {
            debug!(from = %prior, to = %target, "Switching database context");
            self.db
                .use_ns(target.namespace.as_str())
                .use_db(target.database.as_str())
                .await?;
            *current = target.clone();
        }

        let outcome = body(self.db.clone()).await;

        if *current != prior {
            match self
                .db
                .use_ns(prior.namespace.as_str())
                .use_db(prior.database.as_str())
                .await
            {
                Ok(()) => *current = prior,
                // `current` still names the active context, so the next scope
                // switches from the right place.
                Err(err) => warn!(error = %err, to = %prior, "Failed to restore database context"),
            }
        }

        outcome
    }

    /// Run `body` against the home database.
    pub async fn home<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Surreal<Any>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let home = self.home.clone();
        self.within(&home, body).await
    }

    /// Context the connection is currently switched to.
    pub async fn current_target(&self) -> DbTarget {
        self.current.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::error::KgError;

    #[tokio::test]
    async fn test_within_restores_context_on_error() {
        let store = KgStore::memory("kg", "system").await.unwrap();
        let kb = DbTarget::new("kb_ns", "kb_db");

        let result: Result<()> = store
            .within(&kb, |db| async move {
                db.query("CREATE probe:one SET v = 1").await?.check()?;
                Err(KgError::Upsert("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.current_target().await, *store.home_target());

        // The write landed in the knowledge-base database, not at home.
        let home_rows: Vec<i64> = store
            .home(|db| async move { Ok(db.query("SELECT VALUE v FROM probe").await?.take(0)?) })
            .await
            .unwrap();
        assert!(home_rows.is_empty());

        let kb_rows: Vec<i64> = store
            .within(&kb, |db| async move {
                Ok(db.query("SELECT VALUE v FROM probe").await?.take(0)?)
            })
            .await
            .unwrap();
        assert_eq!(kb_rows.len(), 1);
    }
}
