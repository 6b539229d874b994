//! Plan files: the declarations a test makes about the device, in TOML.
//!
//! ```toml
//! [[class]]
//! kind = "device-owner"
//! is-primary = true
//!
//! [[method]]
//! include = "no-restrictions"
//!
//! [groups]
//! no-restrictions = [ { kind = "user-restriction", key = "no_bluetooth", requirement = "absent" } ]
//!
//! [[variants]]
//! name = "on-work-profile"
//! preconditions = [ { kind = "work-profile" } ]
//! ```
//!
//! Class entries come before method entries, and each variant adds its own
//! entries after both. A plan without variants has a single run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::precondition::{
    priority, FailureMode, Level, Origin, Precondition, PreconditionKind, PreconditionRequest,
    Requirement, UserSelector,
};
use crate::testapp::TestAppQuery;
use crate::utils::read_file;

/// Name of the only run of a plan without variants
pub const DEFAULT_RUN: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEntry {
    include: Option<String>,
    kind: Option<PreconditionKind>,
    #[serde(default)]
    requirement: Requirement,
    target_user: Option<UserSelector>,
    #[serde(default)]
    is_primary: bool,
    priority: Option<i32>,
    id: Option<String>,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default)]
    failure_mode: FailureMode,
    query: Option<TestAppQuery>,
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    test_app: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawVariant {
    name: String,
    #[serde(default)]
    preconditions: Vec<RawEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawPlan {
    #[serde(default)]
    class: Vec<RawEntry>,
    #[serde(default)]
    method: Vec<RawEntry>,
    #[serde(default)]
    groups: BTreeMap<String, Vec<RawEntry>>,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

/// One parameterized instantiation of a plan
#[derive(Debug, Clone)]
pub struct PlanRun {
    pub name: String,
    pub requests: Vec<PreconditionRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    pub class: Vec<PreconditionRequest>,
    pub method: Vec<PreconditionRequest>,
    pub variants: Vec<PlanRun>,
}

impl TestPlan {
    pub fn parse(path: &Path) -> crate::Result<Self> {
        let content = read_file(path)?;
        Self::parse_str(&content)
            .map_err(|e| crate::Error::new_plan(&format!("{}: {}", path.display(), e)))
    }

    pub fn parse_str(content: &str) -> crate::Result<Self> {
        let raw: RawPlan = toml::from_str(content).map_err(|e| crate::Error::new_plan(&e))?;
        let expander = Expander {
            groups: &raw.groups,
        };

        let class = expander.expand_all(&raw.class, Level::Class)?;
        let method = expander.expand_all(&raw.method, Level::Method)?;
        let mut variants = Vec::with_capacity(raw.variants.len());
        for v in &raw.variants {
            if variants.iter().any(|r: &PlanRun| r.name == v.name) {
                return Err(crate::Error::new_plan(&format!(
                    "duplicate variant {}",
                    v.name
                )));
            }
            variants.push(PlanRun {
                name: v.name.clone(),
                requests: expander.expand_all(&v.preconditions, Level::Method)?,
            });
        }

        Ok(Self {
            class,
            method,
            variants,
        })
    }

    /// Every run this plan describes, with the full ordered request list of
    /// each
    pub fn runs(&self) -> Vec<PlanRun> {
        let base = || self.class.iter().chain(self.method.iter()).cloned();
        if self.variants.is_empty() {
            return vec![PlanRun {
                name: DEFAULT_RUN.into(),
                requests: base().collect(),
            }];
        }
        self.variants
            .iter()
            .map(|v| PlanRun {
                name: v.name.clone(),
                requests: base().chain(v.requests.iter().cloned()).collect(),
            })
            .collect()
    }

    pub fn run(&self, name: &str) -> Option<PlanRun> {
        self.runs().into_iter().find(|r| r.name == name)
    }
}

struct Expander<'a> {
    groups: &'a BTreeMap<String, Vec<RawEntry>>,
}

impl Expander<'_> {
    fn expand_all(&self, entries: &[RawEntry], level: Level) -> crate::Result<Vec<PreconditionRequest>> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        for e in entries {
            self.expand(e, level, &mut stack, &mut out)?;
        }
        Ok(out)
    }

    fn expand(
        &self,
        entry: &RawEntry,
        level: Level,
        stack: &mut Vec<String>,
        out: &mut Vec<PreconditionRequest>,
    ) -> crate::Result<()> {
        let Some(name) = &entry.include else {
            let origin = Origin {
                level,
                groups: stack.clone(),
            };
            out.push(to_request(entry, origin)?);
            return Ok(());
        };

        if entry.kind.is_some() {
            return Err(crate::Error::new_plan(&format!(
                "entry including {} can't also declare a kind",
                name
            )));
        }
        if stack.contains(name) {
            let mut cycle = stack.clone();
            cycle.push(name.clone());
            return Err(crate::Error::new_plan(&format!(
                "include cycle: {}",
                cycle.join(" -> ")
            )));
        }
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| crate::Error::new_plan(&format!("unknown group {}", name)))?;

        stack.push(name.clone());
        for e in group {
            self.expand(e, level, stack, out)?;
        }
        stack.pop();
        Ok(())
    }
}

fn required<'a>(
    kind: PreconditionKind,
    field: &str,
    value: &'a Option<String>,
) -> crate::Result<&'a String> {
    value
        .as_ref()
        .ok_or_else(|| crate::Error::new_plan(&format!("{} requires `{}`", kind, field)))
}

fn to_request(entry: &RawEntry, origin: Origin) -> crate::Result<PreconditionRequest> {
    let kind = entry
        .kind
        .ok_or_else(|| crate::Error::new_plan("entry needs either `kind` or `include`"))?;
    let query = || entry.query.clone().unwrap_or_default();

    let precondition = match kind {
        PreconditionKind::DeviceOwner => Precondition::DeviceOwner { query: query() },
        PreconditionKind::ProfileOwner => Precondition::ProfileOwner { query: query() },
        PreconditionKind::WorkProfile => Precondition::WorkProfile,
        PreconditionKind::AdditionalUser => Precondition::AdditionalUser,
        PreconditionKind::UserRestriction => Precondition::UserRestriction {
            key: required(kind, "key", &entry.key)?.clone(),
        },
        PreconditionKind::TestAppInstalled => Precondition::TestAppInstalled {
            key: entry.key.clone(),
            query: query(),
        },
        PreconditionKind::Delegate => Precondition::Delegate {
            test_app: required(kind, "test-app", &entry.test_app)?.clone(),
            scopes: entry.scopes.clone(),
        },
        PreconditionKind::GlobalSetting => Precondition::GlobalSetting {
            key: required(kind, "key", &entry.key)?.clone(),
            value: entry.value.clone(),
        },
        PreconditionKind::SecureSetting => Precondition::SecureSetting {
            key: required(kind, "key", &entry.key)?.clone(),
            value: entry.value.clone(),
        },
    };

    Ok(PreconditionRequest {
        precondition,
        requirement: entry.requirement,
        target: entry.target_user.unwrap_or_default(),
        is_primary: entry.is_primary,
        priority: entry.priority.unwrap_or(priority::NOT_IMPORTANT),
        id: entry.id.clone(),
        after: entry.after.clone(),
        failure_mode: entry.failure_mode,
        origin,
    })
}
