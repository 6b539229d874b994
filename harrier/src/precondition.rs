//! The data model for declared device preconditions.
//!
//! A [PreconditionRequest] is the parsed form of one declaration ("ensure a
//! work profile exists", "ensure user restriction `no_add_user` is not set"),
//! it is never mutated after parsing.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::testapp::TestAppQuery;

pub type UserId = u32;

/// Run precedence values used to break ties between otherwise unordered
/// preconditions. Lower runs first.
pub mod priority {
    pub const FIRST: i32 = 10;
    pub const EARLY: i32 = 20;
    pub const MIDDLE: i32 = 50;
    pub const LATE: i32 = 80;
    pub const LAST: i32 = 90;

    pub const NOT_IMPORTANT: i32 = MIDDLE;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreconditionKind {
    DeviceOwner,
    ProfileOwner,
    WorkProfile,
    AdditionalUser,
    UserRestriction,
    TestAppInstalled,
    Delegate,
    GlobalSetting,
    SecureSetting,
}

impl PreconditionKind {
    pub const ALL: [PreconditionKind; 9] = [
        Self::DeviceOwner,
        Self::ProfileOwner,
        Self::WorkProfile,
        Self::AdditionalUser,
        Self::UserRestriction,
        Self::TestAppInstalled,
        Self::Delegate,
        Self::GlobalSetting,
        Self::SecureSetting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceOwner => "device-owner",
            Self::ProfileOwner => "profile-owner",
            Self::WorkProfile => "work-profile",
            Self::AdditionalUser => "additional-user",
            Self::UserRestriction => "user-restriction",
            Self::TestAppInstalled => "test-app-installed",
            Self::Delegate => "delegate",
            Self::GlobalSetting => "global-setting",
            Self::SecureSetting => "secure-setting",
        }
    }

    /// Whether applying this kind can create a user that later preconditions
    /// target.
    pub fn creates_user(&self) -> Option<UserSelector> {
        match self {
            Self::WorkProfile => Some(UserSelector::WorkProfile),
            Self::AdditionalUser => Some(UserSelector::Additional),
            _ => None,
        }
    }
}

impl FromStr for PreconditionKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "device-owner" => Self::DeviceOwner,
            "profile-owner" => Self::ProfileOwner,
            "work-profile" => Self::WorkProfile,
            "additional-user" => Self::AdditionalUser,
            "user-restriction" => Self::UserRestriction,
            "test-app-installed" => Self::TestAppInstalled,
            "delegate" => Self::Delegate,
            "global-setting" => Self::GlobalSetting,
            "secure-setting" => Self::SecureSetting,
            _ => {
                return Err("valid values are 'device-owner', 'profile-owner', 'work-profile', 'additional-user', 'user-restriction', 'test-app-installed', 'delegate', 'global-setting', and 'secure-setting'")
            }
        })
    }
}

impl Display for PreconditionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PreconditionKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PreconditionKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    #[default]
    Present,
    Absent,
}

impl Requirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which user a precondition applies to. Selectors are resolved to numeric
/// ids only when the action runs since earlier actions may create the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserSelector {
    /// The user the test runs as
    #[default]
    Instrumented,
    System,
    Additional,
    WorkProfile,
}

impl UserSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instrumented => "instrumented",
            Self::System => "system",
            Self::Additional => "additional",
            Self::WorkProfile => "work-profile",
        }
    }
}

impl FromStr for UserSelector {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "instrumented" => Self::Instrumented,
            "system" => Self::System,
            "additional" => Self::Additional,
            "work-profile" => Self::WorkProfile,
            _ => return Err("valid values are 'instrumented', 'system', 'additional', and 'work-profile'"),
        })
    }
}

impl Display for UserSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the test when this precondition can't be met
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    #[default]
    Fail,
    Skip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    #[default]
    Class,
    Method,
}

/// Where a request was declared. Used for override resolution and as the
/// final tie breaker in ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Origin {
    pub level: Level,
    /// Names of the groups the request was pulled in through, outermost
    /// first.
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    DeviceOwner {
        query: TestAppQuery,
    },
    ProfileOwner {
        query: TestAppQuery,
    },
    WorkProfile,
    AdditionalUser,
    UserRestriction {
        key: String,
    },
    TestAppInstalled {
        /// Name later preconditions (and the test body) use to refer to the
        /// selected app. Defaults to the package name once selected.
        key: Option<String>,
        query: TestAppQuery,
    },
    Delegate {
        test_app: String,
        scopes: Vec<String>,
    },
    GlobalSetting {
        key: String,
        value: Option<String>,
    },
    /// A setting in the per user `secure` table
    SecureSetting {
        key: String,
        value: Option<String>,
    },
}

impl Precondition {
    pub fn kind(&self) -> PreconditionKind {
        match self {
            Self::DeviceOwner { .. } => PreconditionKind::DeviceOwner,
            Self::ProfileOwner { .. } => PreconditionKind::ProfileOwner,
            Self::WorkProfile => PreconditionKind::WorkProfile,
            Self::AdditionalUser => PreconditionKind::AdditionalUser,
            Self::UserRestriction { .. } => PreconditionKind::UserRestriction,
            Self::TestAppInstalled { .. } => PreconditionKind::TestAppInstalled,
            Self::Delegate { .. } => PreconditionKind::Delegate,
            Self::GlobalSetting { .. } => PreconditionKind::GlobalSetting,
            Self::SecureSetting { .. } => PreconditionKind::SecureSetting,
        }
    }

    /// The kind specific parameter that distinguishes two requests of the
    /// same kind on the same user
    fn identity_param(&self) -> Option<String> {
        match self {
            Self::UserRestriction { key } => Some(key.clone()),
            Self::GlobalSetting { key, .. } | Self::SecureSetting { key, .. } => Some(key.clone()),
            Self::Delegate { test_app, .. } => Some(test_app.clone()),
            Self::TestAppInstalled { key, query } => Some(
                key.clone()
                    .or_else(|| query.exact_package_name().map(String::from))
                    .unwrap_or_else(|| query.to_string()),
            ),
            _ => None,
        }
    }
}

/// The thing a precondition is about, independent of whether it is required
/// present or absent. Two requests with the same identity and different
/// requirements contradict each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub kind: PreconditionKind,
    pub target: UserSelector,
    pub param: Option<String>,
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(p) => write!(f, "{}({}) on {}", self.kind, p, self.target),
            None => write!(f, "{} on {}", self.kind, self.target),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PreconditionRequest {
    pub precondition: Precondition,
    pub requirement: Requirement,
    pub target: UserSelector,
    pub is_primary: bool,
    pub priority: i32,
    pub id: Option<String>,
    pub after: Vec<String>,
    pub failure_mode: FailureMode,
    pub origin: Origin,
}

impl PreconditionRequest {
    pub fn new(precondition: Precondition) -> Self {
        Self {
            precondition,
            requirement: Requirement::Present,
            target: UserSelector::Instrumented,
            is_primary: false,
            priority: priority::NOT_IMPORTANT,
            id: None,
            after: Vec::new(),
            failure_mode: FailureMode::Fail,
            origin: Origin::default(),
        }
    }

    pub fn absent(mut self) -> Self {
        self.requirement = Requirement::Absent;
        self
    }

    pub fn on(mut self, target: UserSelector) -> Self {
        self.target = target;
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn after(mut self, id: &str) -> Self {
        self.after.push(id.into());
        self
    }

    pub fn skip_on_failure(mut self) -> Self {
        self.failure_mode = FailureMode::Skip;
        self
    }

    pub fn at(mut self, level: Level) -> Self {
        self.origin.level = level;
        self
    }

    #[inline]
    pub fn kind(&self) -> PreconditionKind {
        self.precondition.kind()
    }

    /// The user this request actually affects. Device wide state always
    /// lives on the system user no matter what the declaration said.
    pub fn effective_target(&self) -> UserSelector {
        match self.kind() {
            PreconditionKind::DeviceOwner
            | PreconditionKind::AdditionalUser
            | PreconditionKind::GlobalSetting => UserSelector::System,
            _ => self.target,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            kind: self.kind(),
            target: self.effective_target(),
            param: self.precondition.identity_param(),
        }
    }

    /// Whether this request and `other` ask for exactly the same state
    pub fn same_demand(&self, other: &Self) -> bool {
        self.requirement == other.requirement
            && self.precondition == other.precondition
            && self.effective_target() == other.effective_target()
            && self.is_primary == other.is_primary
    }

    pub fn describe(&self) -> String {
        let verb = match self.requirement {
            Requirement::Present => "ensure",
            Requirement::Absent => "ensure no",
        };
        let mut s = format!("{} {}", verb, self.identity());
        if let Some(id) = &self.id {
            s.push_str(&format!(" [{}]", id));
        }
        s
    }
}

impl Display for PreconditionRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("device-owner", PreconditionKind::DeviceOwner)]
    #[case("work-profile", PreconditionKind::WorkProfile)]
    #[case("test-app-installed", PreconditionKind::TestAppInstalled)]
    #[case("global-setting", PreconditionKind::GlobalSetting)]
    #[case("secure-setting", PreconditionKind::SecureSetting)]
    fn test_kind_from_str(#[case] s: &str, #[case] expected: PreconditionKind) {
        assert_eq!(PreconditionKind::from_str(s).unwrap(), expected);
        assert_eq!(expected.to_string(), s);
    }

    #[test]
    fn test_device_wide_identity() {
        let a = PreconditionRequest::new(Precondition::GlobalSetting {
            key: "adb_enabled".into(),
            value: Some("1".into()),
        })
        .on(UserSelector::WorkProfile);
        let b = PreconditionRequest::new(Precondition::GlobalSetting {
            key: "adb_enabled".into(),
            value: None,
        })
        .absent();

        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.effective_target(), UserSelector::System);
    }

    #[test]
    fn test_secure_setting_identity_per_user() {
        let setting = |value: Option<&str>| {
            PreconditionRequest::new(Precondition::SecureSetting {
                key: "location_mode".into(),
                value: value.map(String::from),
            })
        };
        let on_work = setting(Some("3")).on(UserSelector::WorkProfile);
        assert_eq!(on_work.effective_target(), UserSelector::WorkProfile);
        assert_ne!(on_work.identity(), setting(Some("3")).identity());
        assert_eq!(
            setting(Some("3")).identity(),
            setting(None).absent().identity()
        );
        assert_eq!(
            on_work.describe(),
            "ensure secure-setting(location_mode) on work-profile"
        );
    }

    #[test]
    fn test_restriction_identity_keyed() {
        let a = PreconditionRequest::new(Precondition::UserRestriction {
            key: "no_add_user".into(),
        });
        let b = PreconditionRequest::new(Precondition::UserRestriction {
            key: "no_bluetooth".into(),
        });
        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.describe(), "ensure user-restriction(no_add_user) on instrumented");
        assert_eq!(
            b.clone().absent().with_id("bt").describe(),
            "ensure no user-restriction(no_bluetooth) on instrumented [bt]"
        );
    }
}
