use std::fmt::{self, Display, Formatter};

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize};

use super::{ActivityInfo, MetadataInfo, Policy, TestApp, TestAppCatalogEntry, TestAppProvider};

/// Constraint on a string field. In plan files a bare string is shorthand
/// for `{ equal-to = "..." }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StringQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_equal_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct StringQueryFields {
    #[serde(default)]
    equal_to: Option<String>,
    #[serde(default)]
    not_equal_to: Option<String>,
    #[serde(default)]
    starts_with: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringQueryRepr {
    Plain(String),
    Full(StringQueryFields),
}

impl<'de> Deserialize<'de> for StringQuery {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match StringQueryRepr::deserialize(deserializer)? {
            StringQueryRepr::Plain(s) => Self::equal_to(s),
            StringQueryRepr::Full(f) => Self {
                equal_to: f.equal_to,
                not_equal_to: f.not_equal_to,
                starts_with: f.starts_with,
            },
        })
    }
}

impl StringQuery {
    pub fn equal_to<S: Into<String>>(s: S) -> Self {
        Self {
            equal_to: Some(s.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.matches_opt(Some(value))
    }

    pub fn matches_opt(&self, value: Option<&str>) -> bool {
        if let Some(eq) = &self.equal_to {
            if value != Some(eq.as_str()) {
                return false;
            }
        }
        if let Some(ne) = &self.not_equal_to {
            if value == Some(ne.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.starts_with {
            if !value.map_or(false, |v| v.starts_with(prefix.as_str())) {
                return false;
            }
        }
        true
    }
}

impl Display for StringQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = &self.equal_to {
            parts.push(format!("== {:?}", v));
        }
        if let Some(v) = &self.not_equal_to {
            parts.push(format!("!= {:?}", v));
        }
        if let Some(v) = &self.starts_with {
            parts.push(format!("starts with {:?}", v));
        }
        f.write_str(&parts.join(" and "))
    }
}

/// Constraint on an integer field, a bare integer is shorthand for
/// `{ equal-to = N }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IntQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greater_than: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greater_than_or_equal_to: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub less_than: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub less_than_or_equal_to: Option<i32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct IntQueryFields {
    #[serde(default)]
    equal_to: Option<i32>,
    #[serde(default)]
    greater_than: Option<i32>,
    #[serde(default)]
    greater_than_or_equal_to: Option<i32>,
    #[serde(default)]
    less_than: Option<i32>,
    #[serde(default)]
    less_than_or_equal_to: Option<i32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntQueryRepr {
    Plain(i32),
    Full(IntQueryFields),
}

impl<'de> Deserialize<'de> for IntQuery {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match IntQueryRepr::deserialize(deserializer)? {
            IntQueryRepr::Plain(v) => Self {
                equal_to: Some(v),
                ..Default::default()
            },
            IntQueryRepr::Full(f) => Self {
                equal_to: f.equal_to,
                greater_than: f.greater_than,
                greater_than_or_equal_to: f.greater_than_or_equal_to,
                less_than: f.less_than,
                less_than_or_equal_to: f.less_than_or_equal_to,
            },
        })
    }
}

impl IntQuery {
    pub fn matches(&self, value: i32) -> bool {
        self.equal_to.map_or(true, |v| value == v)
            && self.greater_than.map_or(true, |v| value > v)
            && self.greater_than_or_equal_to.map_or(true, |v| value >= v)
            && self.less_than.map_or(true, |v| value < v)
            && self.less_than_or_equal_to.map_or(true, |v| value <= v)
    }
}

impl Display for IntQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let parts = [
            ("==", self.equal_to),
            (">", self.greater_than),
            (">=", self.greater_than_or_equal_to),
            ("<", self.less_than),
            ("<=", self.less_than_or_equal_to),
        ];
        let s = parts
            .iter()
            .filter_map(|(op, v)| v.map(|v| format!("{} {}", op, v)))
            .join(" and ");
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SetQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contains: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub does_not_contain: Vec<String>,
}

impl SetQuery {
    fn is_empty(&self) -> bool {
        self.contains.is_empty() && self.does_not_contain.is_empty()
    }

    fn matches<'a, I>(&self, values: I) -> bool
    where
        I: Iterator<Item = &'a String> + Clone,
    {
        self.contains
            .iter()
            .all(|want| values.clone().any(|v| v == want))
            && self
                .does_not_contain
                .iter()
                .all(|bad| !values.clone().any(|v| v == bad))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MetadataQuery {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StringQuery>,
    /// Require that no metadata with `key` exists
    #[serde(default)]
    pub absent: bool,
}

impl MetadataQuery {
    fn matches(&self, metadata: &[MetadataInfo]) -> bool {
        let found = metadata.iter().any(|m| {
            m.key == self.key && self.value.as_ref().map_or(true, |q| q.matches(&m.value))
        });
        found != self.absent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ActivityQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<StringQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported: Option<bool>,
}

impl ActivityQuery {
    fn matches(&self, activity: &ActivityInfo) -> bool {
        self.class_name
            .as_ref()
            .map_or(true, |q| q.matches(&activity.class_name))
            && self.exported.map_or(true, |e| e == activity.exported)
    }
}

/// A declarative description of the test app a precondition needs.
///
/// Every constraint that is set must hold; an empty query matches any app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct TestAppQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_name: Option<StringQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<StringQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_user_id: Option<StringQuery>,
    #[serde(skip_serializing_if = "SetQuery::is_empty")]
    pub permissions: SetQuery,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataQuery>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<Policy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub activities: Vec<ActivityQuery>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<StringQuery>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<StringQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_sdk_version: Option<IntQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sdk_version: Option<IntQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_sdk_version: Option<IntQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_profile: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_device_admin: Option<bool>,
}

impl TestAppQuery {
    pub fn builder() -> TestAppQueryBuilder<'static> {
        TestAppQueryBuilder::new(None)
    }

    /// The package name if the query pins exactly one
    pub fn exact_package_name(&self) -> Option<&str> {
        self.package_name
            .as_ref()
            .and_then(|q| q.equal_to.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, app: &TestAppCatalogEntry) -> bool {
        self.package_name
            .as_ref()
            .map_or(true, |q| q.matches(&app.package_name))
            && self.label.as_ref().map_or(true, |q| q.matches(&app.label))
            && self
                .shared_user_id
                .as_ref()
                .map_or(true, |q| q.matches_opt(app.shared_user_id.as_deref()))
            && self.permissions.matches(app.permissions.iter())
            && self.metadata.iter().all(|q| q.matches(&app.metadata))
            && self.policies.iter().all(|p| app.policies.contains(p))
            && self
                .activities
                .iter()
                .all(|q| app.activities.iter().any(|a| q.matches(a)))
            && self
                .services
                .iter()
                .all(|q| app.services.iter().any(|s| q.matches(&s.class_name)))
            && self
                .receivers
                .iter()
                .all(|q| app.receivers.iter().any(|r| q.matches(&r.name)))
            && self
                .min_sdk_version
                .as_ref()
                .map_or(true, |q| q.matches(app.min_sdk_version))
            && self
                .max_sdk_version
                .as_ref()
                .map_or(true, |q| q.matches(app.max_sdk_version))
            && self
                .target_sdk_version
                .as_ref()
                .map_or(true, |q| q.matches(app.target_sdk_version))
            && self.cross_profile.map_or(true, |v| v == app.cross_profile)
            && self.test_only.map_or(true, |v| v == app.test_only)
            && self
                .is_device_admin
                .map_or(true, |v| v == app.is_device_admin())
    }
}

impl Display for TestAppQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(q) = &self.package_name {
            parts.push(format!("package-name {}", q));
        }
        if let Some(q) = &self.label {
            parts.push(format!("label {}", q));
        }
        if let Some(q) = &self.shared_user_id {
            parts.push(format!("shared-user-id {}", q));
        }
        if !self.permissions.contains.is_empty() {
            parts.push(format!(
                "permissions contain [{}]",
                self.permissions.contains.join(", ")
            ));
        }
        if !self.permissions.does_not_contain.is_empty() {
            parts.push(format!(
                "permissions lack [{}]",
                self.permissions.does_not_contain.join(", ")
            ));
        }
        for m in &self.metadata {
            match (&m.value, m.absent) {
                (_, true) => parts.push(format!("no metadata {}", m.key)),
                (Some(v), _) => parts.push(format!("metadata {} {}", m.key, v)),
                (None, _) => parts.push(format!("metadata {}", m.key)),
            }
        }
        if !self.policies.is_empty() {
            parts.push(format!("policies [{}]", self.policies.iter().join(", ")));
        }
        for a in &self.activities {
            let mut s = String::from("activity");
            if let Some(c) = &a.class_name {
                s.push_str(&format!(" {}", c));
            }
            if let Some(e) = a.exported {
                s.push_str(if e { " exported" } else { " not exported" });
            }
            parts.push(s);
        }
        for s in &self.services {
            parts.push(format!("service {}", s));
        }
        for r in &self.receivers {
            parts.push(format!("receiver {}", r));
        }
        if let Some(q) = &self.min_sdk_version {
            parts.push(format!("min-sdk {}", q));
        }
        if let Some(q) = &self.max_sdk_version {
            parts.push(format!("max-sdk {}", q));
        }
        if let Some(q) = &self.target_sdk_version {
            parts.push(format!("target-sdk {}", q));
        }
        if let Some(v) = self.cross_profile {
            parts.push(format!("cross-profile {}", v));
        }
        if let Some(v) = self.test_only {
            parts.push(format!("test-only {}", v));
        }
        if let Some(v) = self.is_device_admin {
            parts.push(format!("device-admin {}", v));
        }

        if parts.is_empty() {
            f.write_str("{any}")
        } else {
            write!(f, "{{{}}}", parts.join(", "))
        }
    }
}

type StringField = fn(&mut TestAppQuery) -> &mut Option<StringQuery>;
type IntField = fn(&mut TestAppQuery) -> &mut Option<IntQuery>;
type BoolField = fn(&mut TestAppQuery) -> &mut Option<bool>;
type ListField = fn(&mut TestAppQuery) -> &mut Vec<StringQuery>;

mod fields {
    use super::*;

    pub fn package_name(q: &mut TestAppQuery) -> &mut Option<StringQuery> {
        &mut q.package_name
    }
    pub fn label(q: &mut TestAppQuery) -> &mut Option<StringQuery> {
        &mut q.label
    }
    pub fn shared_user_id(q: &mut TestAppQuery) -> &mut Option<StringQuery> {
        &mut q.shared_user_id
    }
    pub fn min_sdk(q: &mut TestAppQuery) -> &mut Option<IntQuery> {
        &mut q.min_sdk_version
    }
    pub fn max_sdk(q: &mut TestAppQuery) -> &mut Option<IntQuery> {
        &mut q.max_sdk_version
    }
    pub fn target_sdk(q: &mut TestAppQuery) -> &mut Option<IntQuery> {
        &mut q.target_sdk_version
    }
    pub fn cross_profile(q: &mut TestAppQuery) -> &mut Option<bool> {
        &mut q.cross_profile
    }
    pub fn test_only(q: &mut TestAppQuery) -> &mut Option<bool> {
        &mut q.test_only
    }
    pub fn is_device_admin(q: &mut TestAppQuery) -> &mut Option<bool> {
        &mut q.is_device_admin
    }
    pub fn services(q: &mut TestAppQuery) -> &mut Vec<StringQuery> {
        &mut q.services
    }
    pub fn receivers(q: &mut TestAppQuery) -> &mut Vec<StringQuery> {
        &mut q.receivers
    }
}

/// Fluent builder for a [TestAppQuery].
///
/// ```ignore
/// let app = provider
///     .query()
///     .where_package_name()
///     .starts_with("com.android.bedstead")
///     .where_permissions()
///     .contains("android.permission.INTERNET")
///     .get()?;
/// ```
pub struct TestAppQueryBuilder<'p> {
    provider: Option<&'p TestAppProvider>,
    query: TestAppQuery,
}

impl<'p> TestAppQueryBuilder<'p> {
    pub(crate) fn new(provider: Option<&'p TestAppProvider>) -> Self {
        Self {
            provider,
            query: TestAppQuery::default(),
        }
    }

    /// Start from an existing query, replacing anything set so far
    pub fn from_query(mut self, query: TestAppQuery) -> Self {
        self.query = query;
        self
    }

    pub fn where_package_name(self) -> StringQueryBuilder<'p> {
        StringQueryBuilder::new(self, fields::package_name)
    }

    pub fn where_label(self) -> StringQueryBuilder<'p> {
        StringQueryBuilder::new(self, fields::label)
    }

    pub fn where_shared_user_id(self) -> StringQueryBuilder<'p> {
        StringQueryBuilder::new(self, fields::shared_user_id)
    }

    pub fn where_min_sdk_version(self) -> IntQueryBuilder<'p> {
        IntQueryBuilder::new(self, fields::min_sdk)
    }

    pub fn where_max_sdk_version(self) -> IntQueryBuilder<'p> {
        IntQueryBuilder::new(self, fields::max_sdk)
    }

    pub fn where_target_sdk_version(self) -> IntQueryBuilder<'p> {
        IntQueryBuilder::new(self, fields::target_sdk)
    }

    pub fn where_cross_profile(self) -> BoolQueryBuilder<'p> {
        BoolQueryBuilder::new(self, fields::cross_profile)
    }

    pub fn where_test_only(self) -> BoolQueryBuilder<'p> {
        BoolQueryBuilder::new(self, fields::test_only)
    }

    pub fn where_is_device_admin(self) -> BoolQueryBuilder<'p> {
        BoolQueryBuilder::new(self, fields::is_device_admin)
    }

    pub fn where_services(self) -> ComponentQueryBuilder<'p> {
        ComponentQueryBuilder::new(self, fields::services)
    }

    pub fn where_receivers(self) -> ComponentQueryBuilder<'p> {
        ComponentQueryBuilder::new(self, fields::receivers)
    }

    pub fn where_permissions(self) -> PermissionsQueryBuilder<'p> {
        PermissionsQueryBuilder { parent: self }
    }

    pub fn where_policies(self) -> PoliciesQueryBuilder<'p> {
        PoliciesQueryBuilder { parent: self }
    }

    pub fn where_metadata(self) -> MetadataQueryBuilder<'p> {
        MetadataQueryBuilder { parent: self }
    }

    pub fn where_activities(self) -> ActivitiesQueryBuilder<'p> {
        ActivitiesQueryBuilder { parent: self }
    }

    pub fn build(self) -> TestAppQuery {
        self.query
    }

    /// Pick the first available app matching the query and mark it used
    pub fn get(self) -> crate::Result<TestApp> {
        match self.provider {
            Some(p) => p.get(&self.query),
            None => Err(crate::Error::new_generic(
                "query was built without a test app provider",
            )),
        }
    }
}

pub struct StringQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
    field: StringField,
}

impl<'p> StringQueryBuilder<'p> {
    fn new(parent: TestAppQueryBuilder<'p>, field: StringField) -> Self {
        Self { parent, field }
    }

    fn with(mut self, f: impl FnOnce(&mut StringQuery)) -> TestAppQueryBuilder<'p> {
        let slot = (self.field)(&mut self.parent.query);
        f(slot.get_or_insert_with(StringQuery::default));
        self.parent
    }

    pub fn is_equal_to(self, value: &str) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.equal_to = Some(value.into()))
    }

    pub fn is_not_equal_to(self, value: &str) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.not_equal_to = Some(value.into()))
    }

    pub fn starts_with(self, prefix: &str) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.starts_with = Some(prefix.into()))
    }
}

pub struct IntQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
    field: IntField,
}

impl<'p> IntQueryBuilder<'p> {
    fn new(parent: TestAppQueryBuilder<'p>, field: IntField) -> Self {
        Self { parent, field }
    }

    fn with(mut self, f: impl FnOnce(&mut IntQuery)) -> TestAppQueryBuilder<'p> {
        let slot = (self.field)(&mut self.parent.query);
        f(slot.get_or_insert_with(IntQuery::default));
        self.parent
    }

    pub fn is_equal_to(self, value: i32) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.equal_to = Some(value))
    }

    pub fn is_greater_than(self, value: i32) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.greater_than = Some(value))
    }

    pub fn is_greater_than_or_equal_to(self, value: i32) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.greater_than_or_equal_to = Some(value))
    }

    pub fn is_less_than(self, value: i32) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.less_than = Some(value))
    }

    pub fn is_less_than_or_equal_to(self, value: i32) -> TestAppQueryBuilder<'p> {
        self.with(|q| q.less_than_or_equal_to = Some(value))
    }
}

pub struct BoolQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
    field: BoolField,
}

impl<'p> BoolQueryBuilder<'p> {
    fn new(parent: TestAppQueryBuilder<'p>, field: BoolField) -> Self {
        Self { parent, field }
    }

    pub fn is_equal_to(mut self, value: bool) -> TestAppQueryBuilder<'p> {
        *(self.field)(&mut self.parent.query) = Some(value);
        self.parent
    }

    pub fn is_true(self) -> TestAppQueryBuilder<'p> {
        self.is_equal_to(true)
    }

    pub fn is_false(self) -> TestAppQueryBuilder<'p> {
        self.is_equal_to(false)
    }
}

pub struct ComponentQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
    field: ListField,
}

impl<'p> ComponentQueryBuilder<'p> {
    fn new(parent: TestAppQueryBuilder<'p>, field: ListField) -> Self {
        Self { parent, field }
    }

    /// Require a component with exactly this class name
    pub fn contains(mut self, class_name: &str) -> TestAppQueryBuilder<'p> {
        (self.field)(&mut self.parent.query).push(StringQuery::equal_to(class_name));
        self.parent
    }
}

pub struct PermissionsQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
}

impl<'p> PermissionsQueryBuilder<'p> {
    pub fn contains(mut self, permission: &str) -> TestAppQueryBuilder<'p> {
        self.parent.query.permissions.contains.push(permission.into());
        self.parent
    }

    pub fn does_not_contain(mut self, permission: &str) -> TestAppQueryBuilder<'p> {
        self.parent
            .query
            .permissions
            .does_not_contain
            .push(permission.into());
        self.parent
    }
}

pub struct PoliciesQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
}

impl<'p> PoliciesQueryBuilder<'p> {
    pub fn contains(mut self, policy: Policy) -> TestAppQueryBuilder<'p> {
        if !self.parent.query.policies.contains(&policy) {
            self.parent.query.policies.push(policy);
        }
        self.parent
    }
}

pub struct MetadataQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
}

impl<'p> MetadataQueryBuilder<'p> {
    pub fn key(self, key: &str) -> MetadataKeyQueryBuilder<'p> {
        MetadataKeyQueryBuilder {
            parent: self.parent,
            key: key.into(),
        }
    }
}

pub struct MetadataKeyQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
    key: String,
}

impl<'p> MetadataKeyQueryBuilder<'p> {
    fn push(mut self, value: Option<StringQuery>, absent: bool) -> TestAppQueryBuilder<'p> {
        self.parent.query.metadata.push(MetadataQuery {
            key: self.key,
            value,
            absent,
        });
        self.parent
    }

    pub fn exists(self) -> TestAppQueryBuilder<'p> {
        self.push(None, false)
    }

    pub fn does_not_exist(self) -> TestAppQueryBuilder<'p> {
        self.push(None, true)
    }

    pub fn is_equal_to(self, value: &str) -> TestAppQueryBuilder<'p> {
        self.push(Some(StringQuery::equal_to(value)), false)
    }
}

pub struct ActivitiesQueryBuilder<'p> {
    parent: TestAppQueryBuilder<'p>,
}

impl<'p> ActivitiesQueryBuilder<'p> {
    pub fn contains(mut self, query: ActivityQuery) -> TestAppQueryBuilder<'p> {
        self.parent.query.activities.push(query);
        self.parent
    }

    pub fn contains_class(self, class_name: &str) -> TestAppQueryBuilder<'p> {
        self.contains(ActivityQuery {
            class_name: Some(StringQuery::equal_to(class_name)),
            exported: None,
        })
    }

    pub fn contains_exported(self) -> TestAppQueryBuilder<'p> {
        self.contains(ActivityQuery {
            class_name: None,
            exported: Some(true),
        })
    }
}
