//! The catalog of installable test apps and the fluent queries used to pick
//! one.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::utils::read_file;

pub mod index;
pub use index::{AndroidApp, Permission, TestAppIndex};

pub mod policies;
pub use policies::Policy;

pub mod query;
pub use query::{IntQuery, StringQuery, TestAppQuery, TestAppQueryBuilder};

mod provider;
pub use provider::{CatalogSource, TestAppProvider};

/// Metadata key marking a receiver as a device admin receiver
pub const DEVICE_ADMIN_METADATA: &str = "android.app.device_admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataInfo {
    pub key: String,
    pub value: String,
    /// Content of the XML resource `value` names, if it names one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentFilterInfo {
    pub actions: Vec<String>,
    pub categories: Vec<String>,
}

impl From<index::IntentFilter> for IntentFilterInfo {
    fn from(f: index::IntentFilter) -> Self {
        Self {
            actions: f.actions,
            categories: f.categories,
        }
    }
}

fn filters_from_proto(filters: Vec<index::IntentFilter>) -> Vec<IntentFilterInfo> {
    filters.into_iter().map(IntentFilterInfo::from).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityInfo {
    pub class_name: String,
    pub exported: bool,
    pub permission: Option<String>,
    pub intent_filters: Vec<IntentFilterInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub class_name: String,
    pub intent_filters: Vec<IntentFilterInfo>,
    pub metadata: Vec<MetadataInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiverInfo {
    pub name: String,
    pub metadata: Vec<MetadataInfo>,
}

/// One app in the catalog, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestAppCatalogEntry {
    pub package_name: String,
    pub label: String,
    pub shared_user_id: Option<String>,
    pub min_sdk_version: i32,
    pub max_sdk_version: i32,
    pub target_sdk_version: i32,
    pub test_only: bool,
    pub cross_profile: bool,
    pub metadata: Vec<MetadataInfo>,
    pub permissions: BTreeSet<String>,
    pub activities: Vec<ActivityInfo>,
    pub activity_aliases: Vec<ActivityInfo>,
    pub services: Vec<ServiceInfo>,
    pub receivers: Vec<ReceiverInfo>,
    pub policies: BTreeSet<Policy>,
}

fn metadata_from_proto(
    md: Vec<index::Metadata>,
    resources: Option<&Path>,
    policies: &mut BTreeSet<Policy>,
) -> crate::Result<Vec<MetadataInfo>> {
    let mut infos = Vec::with_capacity(md.len());
    for it in md {
        let mut resource = None;
        if !it.resource.is_empty() && !it.value.is_empty() {
            if let Some(dir) = resources {
                let content = read_file(&dir.join(format!("{}.xml", it.value)))?;
                if let Some(found) = policies::parse_uses_policies(&content)? {
                    policies.extend(found);
                }
                resource = Some(content);
            }
        }
        infos.push(MetadataInfo {
            key: it.name,
            value: it.value,
            resource,
        });
    }
    Ok(infos)
}

fn activity_from_proto(a: index::Activity) -> ActivityInfo {
    ActivityInfo {
        class_name: a.name,
        exported: a.exported,
        permission: if a.permission.is_empty() {
            None
        } else {
            Some(a.permission)
        },
        intent_filters: filters_from_proto(a.intent_filters),
    }
}

impl TestAppCatalogEntry {
    /// Build an entry from its index form, reading any XML resources its
    /// metadata points to out of `resources`.
    pub fn from_proto(app: AndroidApp, resources: Option<&Path>) -> crate::Result<Self> {
        let mut policies = BTreeSet::new();

        let metadata = metadata_from_proto(app.metadata, resources, &mut policies)?;

        let mut services = Vec::with_capacity(app.services.len());
        for s in app.services {
            services.push(ServiceInfo {
                class_name: s.name,
                intent_filters: filters_from_proto(s.intent_filters),
                metadata: metadata_from_proto(s.metadata, resources, &mut policies)?,
            });
        }

        let mut receivers = Vec::with_capacity(app.receivers.len());
        for r in app.receivers {
            receivers.push(ReceiverInfo {
                name: r.name,
                metadata: metadata_from_proto(r.metadata, resources, &mut policies)?,
            });
        }

        Ok(Self {
            package_name: app.package_name,
            label: app.label,
            shared_user_id: if app.uses_shared_user_id.is_empty() {
                None
            } else {
                Some(app.uses_shared_user_id)
            },
            min_sdk_version: app.min_sdk_version,
            max_sdk_version: app.max_sdk_version,
            target_sdk_version: app.target_sdk_version,
            test_only: app.test_only,
            cross_profile: app.cross_profile,
            metadata,
            permissions: app.permissions.into_iter().map(|p| p.name).collect(),
            activities: app.activities.into_iter().map(activity_from_proto).collect(),
            activity_aliases: app
                .activity_aliases
                .into_iter()
                .map(activity_from_proto)
                .collect(),
            services,
            receivers,
            policies,
        })
    }

    pub fn admin_receiver(&self) -> Option<&ReceiverInfo> {
        self.receivers
            .iter()
            .find(|r| r.metadata.iter().any(|m| m.key == DEVICE_ADMIN_METADATA))
    }

    pub fn is_device_admin(&self) -> bool {
        self.admin_receiver().is_some()
    }

    /// The flattened component name of the admin receiver, e.g.
    /// `com.example.dpc/.AdminReceiver`
    pub fn admin_component(&self) -> Option<String> {
        self.admin_receiver()
            .map(|r| format!("{}/{}", self.package_name, r.name))
    }
}

/// A test app handed out by the catalog, ready to be installed.
#[derive(Debug, Clone, PartialEq)]
pub struct TestApp {
    entry: Arc<TestAppCatalogEntry>,
    apk: PathBuf,
}

impl TestApp {
    pub fn new(entry: Arc<TestAppCatalogEntry>, apk: PathBuf) -> Self {
        Self { entry, apk }
    }

    #[inline]
    pub fn package_name(&self) -> &str {
        &self.entry.package_name
    }

    #[inline]
    pub fn entry(&self) -> &TestAppCatalogEntry {
        &self.entry
    }

    #[inline]
    pub fn apk_path(&self) -> &Path {
        &self.apk
    }

    pub fn admin_component(&self) -> Option<String> {
        self.entry.admin_component()
    }
}
