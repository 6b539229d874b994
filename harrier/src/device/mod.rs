//! The seam between the harness and an actual device.
//!
//! Everything the precondition handlers do to a device goes through [Device],
//! which lets the whole pipeline run against an in-memory fake in tests.

use std::fmt::{self, Display, Formatter};
use std::path::Path;

use serde::Serialize;

use crate::precondition::UserId;

mod adb;
pub use adb::AdbDevice;

pub const SYSTEM_USER: UserId = 0;

/// Android's type string for managed (work) profiles
pub const MANAGED_PROFILE_TYPE: &str = "android.os.usertype.profile.MANAGED";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub user_type: String,
    /// Set for profiles
    pub parent: Option<UserId>,
}

impl UserInfo {
    pub fn is_managed_profile(&self) -> bool {
        self.user_type == MANAGED_PROFILE_TYPE || self.user_type.ends_with("profile.MANAGED")
    }

    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_USER
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerKind {
    DeviceOwner,
    ProfileOwner,
}

impl Display for OwnerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeviceOwner => "device owner",
            Self::ProfileOwner => "profile owner",
        })
    }
}

/// A device or profile owner as reported by the device
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Owner {
    /// Flattened component name, `package/receiver`
    pub component: String,
    pub user: UserId,
    pub kind: OwnerKind,
}

impl Owner {
    pub fn package(&self) -> &str {
        self.component
            .split_once('/')
            .map(|(p, _)| p)
            .unwrap_or(&self.component)
    }
}

/// Blocking operations on a single device. Every method is bounded by the
/// transport's command timeout.
///
/// Errors are classified: [crate::Error::TransientProvisioning] may succeed
/// if retried, anything else won't.
pub trait Device: Send + Sync {
    fn users(&self) -> crate::Result<Vec<UserInfo>>;

    /// The user in the foreground
    fn current_user(&self) -> crate::Result<UserId>;

    /// Create a user, or a managed profile of `profile_of`
    fn create_user(&self, name: &str, profile_of: Option<UserId>) -> crate::Result<UserId>;

    fn remove_user(&self, user: UserId) -> crate::Result<()>;

    fn is_installed(&self, package: &str, user: UserId) -> crate::Result<bool>;

    fn install(&self, apk: &Path, user: UserId) -> crate::Result<()>;

    fn uninstall(&self, package: &str, user: UserId) -> crate::Result<()>;

    /// Every device and profile owner on the device
    fn owners(&self) -> crate::Result<Vec<Owner>>;

    fn set_device_owner(&self, component: &str, user: UserId) -> crate::Result<()>;

    fn set_profile_owner(&self, component: &str, user: UserId) -> crate::Result<()>;

    /// Removes an admin, which also clears it as device or profile owner
    fn remove_active_admin(&self, component: &str, user: UserId) -> crate::Result<()>;

    fn user_restriction(&self, key: &str, user: UserId) -> crate::Result<bool>;

    fn set_user_restriction(&self, key: &str, user: UserId, value: bool) -> crate::Result<()>;

    fn global_setting(&self, key: &str) -> crate::Result<Option<String>>;

    fn put_global_setting(&self, key: &str, value: &str) -> crate::Result<()>;

    fn delete_global_setting(&self, key: &str) -> crate::Result<()>;

    fn secure_setting(&self, key: &str, user: UserId) -> crate::Result<Option<String>>;

    fn put_secure_setting(&self, key: &str, user: UserId, value: &str) -> crate::Result<()>;

    fn delete_secure_setting(&self, key: &str, user: UserId) -> crate::Result<()>;

    /// Scopes `admin` currently delegates to `package`, empty if none
    fn delegated_scopes(&self, admin: &str, package: &str, user: UserId) -> crate::Result<Vec<String>>;

    /// Ask the admin `admin` (a flattened component) to delegate `scopes` to
    /// `package`. An empty list clears the delegation.
    fn set_delegated_scopes(
        &self,
        admin: &str,
        package: &str,
        user: UserId,
        scopes: &[String],
    ) -> crate::Result<()>;

    fn find_user(&self, id: UserId) -> crate::Result<Option<UserInfo>> {
        Ok(self.users()?.into_iter().find(|u| u.id == id))
    }

    fn device_owner(&self) -> crate::Result<Option<Owner>> {
        Ok(self
            .owners()?
            .into_iter()
            .find(|o| o.kind == OwnerKind::DeviceOwner))
    }

    fn profile_owner(&self, user: UserId) -> crate::Result<Option<Owner>> {
        Ok(self
            .owners()?
            .into_iter()
            .find(|o| o.kind == OwnerKind::ProfileOwner && o.user == user))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_owner_package() {
        let owner = Owner {
            component: "com.example.dpc/.AdminReceiver".into(),
            user: 0,
            kind: OwnerKind::DeviceOwner,
        };
        assert_eq!(owner.package(), "com.example.dpc");
    }
}
