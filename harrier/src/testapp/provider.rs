use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use once_cell::sync::OnceCell;

use super::{TestApp, TestAppCatalogEntry, TestAppIndex, TestAppQuery, TestAppQueryBuilder};
use crate::config::CatalogConfig;
use crate::utils::read_file_bytes;

/// Where the catalog comes from
pub enum CatalogSource {
    /// A binary index on disk plus the directories holding XML resources and
    /// the APKs themselves
    Index {
        index: PathBuf,
        resources: Option<PathBuf>,
        apks: PathBuf,
    },
    /// Entries that are already loaded
    Entries {
        entries: Vec<TestAppCatalogEntry>,
        apks: PathBuf,
    },
}

impl CatalogSource {
    fn apks(&self) -> &Path {
        match self {
            Self::Index { apks, .. } => apks,
            Self::Entries { apks, .. } => apks,
        }
    }
}

#[derive(Default)]
struct Pool {
    available: Vec<Arc<TestAppCatalogEntry>>,
    snapshot: Option<Vec<Arc<TestAppCatalogEntry>>>,
}

/// The catalog of test apps.
///
/// The index is loaded on first use and never again. Apps handed out by
/// [TestAppProvider::get] are removed from the available pool so two
/// preconditions in one test never share an app, [TestAppProvider::snapshot]
/// and [TestAppProvider::restore] bracket a test so every test starts from
/// the same pool.
pub struct TestAppProvider {
    source: CatalogSource,
    loaded: OnceCell<Vec<Arc<TestAppCatalogEntry>>>,
    pool: Mutex<Option<Pool>>,
}

impl TestAppProvider {
    pub fn new(source: CatalogSource) -> Self {
        Self {
            source,
            loaded: OnceCell::new(),
            pool: Mutex::new(None),
        }
    }

    /// Build a provider from the `[catalog]` section, relative paths are
    /// resolved against `base`.
    pub fn from_config(cfg: &CatalogConfig, base: &Path) -> Self {
        let abs = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        Self::new(CatalogSource::Index {
            index: abs(&cfg.index),
            resources: cfg.resources.as_deref().map(abs),
            apks: abs(&cfg.apks),
        })
    }

    pub fn from_entries(entries: Vec<TestAppCatalogEntry>, apks: PathBuf) -> Self {
        Self::new(CatalogSource::Entries { entries, apks })
    }

    fn load(&self) -> crate::Result<&Vec<Arc<TestAppCatalogEntry>>> {
        self.loaded.get_or_try_init(|| {
            let mut entries = match &self.source {
                CatalogSource::Entries { entries, .. } => entries.clone(),
                CatalogSource::Index {
                    index, resources, ..
                } => {
                    debug!("loading test app index from {}", index.display());
                    let bytes = read_file_bytes(index)?;
                    let parsed = TestAppIndex::parse(&bytes)?;
                    let mut entries = Vec::with_capacity(parsed.apps.len());
                    for app in parsed.apps {
                        entries.push(TestAppCatalogEntry::from_proto(app, resources.as_deref())?);
                    }
                    entries
                }
            };
            entries.sort_by(|a, b| a.package_name.cmp(&b.package_name));
            debug!("loaded {} test apps", entries.len());
            Ok(entries.into_iter().map(Arc::new).collect())
        })
    }

    fn lock_pool(&self) -> crate::Result<MutexGuard<'_, Option<Pool>>> {
        let loaded = self.load()?;
        let mut guard = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(Pool {
                available: loaded.clone(),
                snapshot: None,
            });
        }
        Ok(guard)
    }

    fn with_pool<R>(&self, f: impl FnOnce(&mut Pool) -> crate::Result<R>) -> crate::Result<R> {
        let mut guard = self.lock_pool()?;
        match guard.as_mut() {
            Some(pool) => f(pool),
            None => Err(crate::Error::new_generic("test app pool not initialised")),
        }
    }

    /// Begin a query for a [TestApp]
    pub fn query(&self) -> TestAppQueryBuilder<'_> {
        TestAppQueryBuilder::new(Some(self))
    }

    /// Get any [TestApp]
    pub fn any(&self) -> crate::Result<TestApp> {
        let app = self.query().get()?;
        debug!("any(): returning {}", app.package_name());
        Ok(app)
    }

    /// Take the first available app, in package name order, matching
    /// `query`.
    pub fn get(&self, query: &TestAppQuery) -> crate::Result<TestApp> {
        let apks = self.source.apks();
        self.with_pool(|pool| {
            let idx = pool
                .available
                .iter()
                .position(|e| query.matches(e))
                .ok_or_else(|| crate::Error::NoMatchingTestApp(query.to_string()))?;
            let entry = pool.available.remove(idx);
            trace!("test app {} matched {}", entry.package_name, query);
            let apk = apks.join(format!("{}.apk", entry.package_name));
            Ok(TestApp::new(entry, apk))
        })
    }

    /// Every available app matching `query` without marking any as used
    pub fn matching(&self, query: &TestAppQuery) -> crate::Result<Vec<Arc<TestAppCatalogEntry>>> {
        self.with_pool(|pool| {
            Ok(pool
                .available
                .iter()
                .filter(|e| query.matches(e))
                .cloned()
                .collect())
        })
    }

    /// Every app in the index, used or not
    pub fn entries(&self) -> crate::Result<Vec<Arc<TestAppCatalogEntry>>> {
        Ok(self.load()?.clone())
    }

    pub fn available_count(&self) -> crate::Result<usize> {
        self.with_pool(|pool| Ok(pool.available.len()))
    }

    /// Remove the app with this package from the available pool
    pub fn mark_used(&self, package: &str) -> crate::Result<()> {
        self.with_pool(|pool| {
            pool.available.retain(|e| e.package_name != package);
            Ok(())
        })
    }

    /// Save the state of the pool, to be reset by [TestAppProvider::restore]
    pub fn snapshot(&self) -> crate::Result<()> {
        self.with_pool(|pool| {
            pool.snapshot = Some(pool.available.clone());
            Ok(())
        })
    }

    /// Restore the pool to exactly what it was at the last
    /// [TestAppProvider::snapshot]
    pub fn restore(&self) -> crate::Result<()> {
        self.with_pool(|pool| match &pool.snapshot {
            Some(snap) => {
                pool.available = snap.clone();
                Ok(())
            }
            None => Err(crate::Error::CatalogNotSnapshotted),
        })
    }

    /// Drop the pool and any snapshot. The index is not reloaded afterwards
    /// so every later query fails.
    pub fn release_resources(&self) {
        let mut guard = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Pool::default());
    }
}
