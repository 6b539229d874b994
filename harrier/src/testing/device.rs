use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mockall::mock;
use rstest::fixture;

use crate::device::{Device, Owner, OwnerKind, UserInfo, MANAGED_PROFILE_TYPE, SYSTEM_USER};
use crate::precondition::UserId;

mock! {
    pub Device {

    }

    impl crate::device::Device for Device {
        fn users(&self) -> crate::Result<Vec<UserInfo>>;
        fn current_user(&self) -> crate::Result<UserId>;
        fn create_user(&self, name: &str, profile_of: Option<UserId>) -> crate::Result<UserId>;
        fn remove_user(&self, user: UserId) -> crate::Result<()>;
        fn is_installed(&self, package: &str, user: UserId) -> crate::Result<bool>;
        fn install(&self, apk: &Path, user: UserId) -> crate::Result<()>;
        fn uninstall(&self, package: &str, user: UserId) -> crate::Result<()>;
        fn owners(&self) -> crate::Result<Vec<Owner>>;
        fn set_device_owner(&self, component: &str, user: UserId) -> crate::Result<()>;
        fn set_profile_owner(&self, component: &str, user: UserId) -> crate::Result<()>;
        fn remove_active_admin(&self, component: &str, user: UserId) -> crate::Result<()>;
        fn user_restriction(&self, key: &str, user: UserId) -> crate::Result<bool>;
        fn set_user_restriction(&self, key: &str, user: UserId, value: bool) -> crate::Result<()>;
        fn global_setting(&self, key: &str) -> crate::Result<Option<String>>;
        fn put_global_setting(&self, key: &str, value: &str) -> crate::Result<()>;
        fn delete_global_setting(&self, key: &str) -> crate::Result<()>;
        fn secure_setting(&self, key: &str, user: UserId) -> crate::Result<Option<String>>;
        fn put_secure_setting(&self, key: &str, user: UserId, value: &str) -> crate::Result<()>;
        fn delete_secure_setting(&self, key: &str, user: UserId) -> crate::Result<()>;
        fn delegated_scopes(&self, admin: &str, package: &str, user: UserId) -> crate::Result<Vec<String>>;
        fn set_delegated_scopes(
            &self,
            admin: &str,
            package: &str,
            user: UserId,
            scopes: &[String],
        ) -> crate::Result<()>;
    }
}

#[fixture]
pub fn mock_device() -> MockDevice {
    MockDevice::new()
}

#[fixture]
pub fn fake_device() -> FakeDevice {
    FakeDevice::default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailKind {
    Transient,
    Fatal,
    Timeout,
}

struct Injected {
    operation: &'static str,
    kind: FailKind,
    /// `None` fails forever
    remaining: Option<usize>,
}

/// Everything the fake knows about the device, compared wholesale in tests
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeState {
    pub users: Vec<UserInfo>,
    pub installed: BTreeSet<(UserId, String)>,
    pub owners: Vec<Owner>,
    pub restrictions: BTreeSet<(UserId, String)>,
    pub settings: BTreeMap<String, String>,
    pub secure_settings: BTreeMap<(UserId, String), String>,
    pub delegations: BTreeMap<(UserId, String), Vec<String>>,
}

struct Inner {
    state: FakeState,
    next_user: UserId,
    calls: Vec<String>,
    failures: Vec<Injected>,
}

/// An in-memory [Device] that records every mutating call and can be told
/// to fail specific operations.
pub struct FakeDevice {
    inner: Mutex<Inner>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        let state = FakeState {
            users: vec![UserInfo {
                id: SYSTEM_USER,
                name: "Owner".into(),
                user_type: "android.os.usertype.full.SYSTEM".into(),
                parent: None,
            }],
            ..Default::default()
        };
        Self {
            inner: Mutex::new(Inner {
                state,
                next_user: 10,
                calls: Vec::new(),
                failures: Vec::new(),
            }),
        }
    }
}

#[allow(dead_code)]
impl FakeDevice {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail_times(&self, operation: &'static str, kind: FailKind, times: usize) {
        self.lock().failures.push(Injected {
            operation,
            kind,
            remaining: Some(times),
        });
    }

    /// Fail every call of `operation`
    pub fn fail_always(&self, operation: &'static str, kind: FailKind) {
        self.lock().failures.push(Injected {
            operation,
            kind,
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn state(&self) -> FakeState {
        self.lock().state.clone()
    }

    pub fn with_state(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.lock().state)
    }

    /// Mutating calls in the order they succeeded
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Check for an injected failure, then run `f` on the state and record
    /// `call` if it succeeds.
    fn mutate<R>(
        &self,
        operation: &'static str,
        call: String,
        f: impl FnOnce(&mut Inner) -> crate::Result<R>,
    ) -> crate::Result<R> {
        let mut inner = self.lock();
        injected(&mut inner, operation)?;
        let res = f(&mut *inner)?;
        inner.calls.push(call);
        Ok(res)
    }

    fn read<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&FakeState) -> crate::Result<R>,
    ) -> crate::Result<R> {
        let mut inner = self.lock();
        injected(&mut inner, operation)?;
        f(&inner.state)
    }
}

fn injected(inner: &mut Inner, operation: &'static str) -> crate::Result<()> {
    let Some(idx) = inner
        .failures
        .iter()
        .position(|f| f.operation == operation && f.remaining != Some(0))
    else {
        return Ok(());
    };
    let fail = &mut inner.failures[idx];
    if let Some(n) = fail.remaining.as_mut() {
        *n -= 1;
    }
    let message = format!("injected failure in {}", operation);
    Err(match fail.kind {
        FailKind::Transient => crate::Error::TransientProvisioning {
            operation: operation.into(),
            message,
        },
        FailKind::Fatal => crate::Error::FatalProvisioning {
            operation: operation.into(),
            message,
        },
        FailKind::Timeout => crate::Error::CommandTimeout(operation.into(), 120),
    })
}

fn fatal(operation: &str, message: impl Into<String>) -> crate::Error {
    crate::Error::FatalProvisioning {
        operation: operation.into(),
        message: message.into(),
    }
}

impl Device for FakeDevice {
    fn users(&self) -> crate::Result<Vec<UserInfo>> {
        self.read("users", |s| Ok(s.users.clone()))
    }

    fn current_user(&self) -> crate::Result<UserId> {
        self.read("current_user", |_| Ok(SYSTEM_USER))
    }

    fn create_user(&self, name: &str, profile_of: Option<UserId>) -> crate::Result<UserId> {
        let call = match profile_of {
            Some(p) => format!("create_user {} profile-of {}", name, p),
            None => format!("create_user {}", name),
        };
        self.mutate("create_user", call, |inner| {
            let id = inner.next_user;
            inner.next_user += 1;
            inner.state.users.push(UserInfo {
                id,
                name: name.into(),
                user_type: match profile_of {
                    Some(_) => MANAGED_PROFILE_TYPE.into(),
                    None => "android.os.usertype.full.SECONDARY".into(),
                },
                parent: profile_of,
            });
            Ok(id)
        })
    }

    fn remove_user(&self, user: UserId) -> crate::Result<()> {
        self.mutate("remove_user", format!("remove_user {}", user), |inner| {
            let s = &mut inner.state;
            let before = s.users.len();
            s.users.retain(|u| u.id != user);
            if s.users.len() == before {
                return Err(fatal("remove_user", format!("no user {}", user)));
            }
            s.installed.retain(|(u, _)| *u != user);
            s.owners.retain(|o| o.user != user);
            s.restrictions.retain(|(u, _)| *u != user);
            s.secure_settings.retain(|(u, _), _| *u != user);
            s.delegations.retain(|(u, _), _| *u != user);
            Ok(())
        })
    }

    fn is_installed(&self, package: &str, user: UserId) -> crate::Result<bool> {
        self.read("is_installed", |s| {
            Ok(s.installed.contains(&(user, package.to_string())))
        })
    }

    fn install(&self, apk: &Path, user: UserId) -> crate::Result<()> {
        let package = apk
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| fatal("install", "bad apk path"))?;
        self.mutate("install", format!("install {} {}", package, user), |inner| {
            if !inner.state.users.iter().any(|u| u.id == user) {
                return Err(fatal("install", format!("no user {}", user)));
            }
            inner.state.installed.insert((user, package));
            Ok(())
        })
    }

    fn uninstall(&self, package: &str, user: UserId) -> crate::Result<()> {
        self.mutate(
            "uninstall",
            format!("uninstall {} {}", package, user),
            |inner| {
                if !inner.state.installed.remove(&(user, package.to_string())) {
                    return Err(fatal("uninstall", format!("{} not installed", package)));
                }
                inner.state.owners.retain(|o| !(o.user == user && o.package() == package));
                Ok(())
            },
        )
    }

    fn owners(&self) -> crate::Result<Vec<Owner>> {
        self.read("owners", |s| Ok(s.owners.clone()))
    }

    fn set_device_owner(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.mutate(
            "set_device_owner",
            format!("set_device_owner {} {}", component, user),
            |inner| {
                let s = &mut inner.state;
                if s.owners.iter().any(|o| o.kind == OwnerKind::DeviceOwner) {
                    return Err(fatal("set_device_owner", "device owner already set"));
                }
                let owner = Owner {
                    component: component.into(),
                    user,
                    kind: OwnerKind::DeviceOwner,
                };
                if !s.installed.contains(&(user, owner.package().to_string())) {
                    return Err(fatal("set_device_owner", "admin not installed"));
                }
                s.owners.push(owner);
                Ok(())
            },
        )
    }

    fn set_profile_owner(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.mutate(
            "set_profile_owner",
            format!("set_profile_owner {} {}", component, user),
            |inner| {
                let s = &mut inner.state;
                if s
                    .owners
                    .iter()
                    .any(|o| o.kind == OwnerKind::ProfileOwner && o.user == user)
                {
                    return Err(fatal("set_profile_owner", "profile owner already set"));
                }
                let owner = Owner {
                    component: component.into(),
                    user,
                    kind: OwnerKind::ProfileOwner,
                };
                if !s.installed.contains(&(user, owner.package().to_string())) {
                    return Err(fatal("set_profile_owner", "admin not installed"));
                }
                s.owners.push(owner);
                Ok(())
            },
        )
    }

    fn remove_active_admin(&self, component: &str, user: UserId) -> crate::Result<()> {
        self.mutate(
            "remove_active_admin",
            format!("remove_active_admin {} {}", component, user),
            |inner| {
                let before = inner.state.owners.len();
                inner
                    .state
                    .owners
                    .retain(|o| !(o.component == component && o.user == user));
                if inner.state.owners.len() == before {
                    return Err(fatal("remove_active_admin", "not an active admin"));
                }
                Ok(())
            },
        )
    }

    fn user_restriction(&self, key: &str, user: UserId) -> crate::Result<bool> {
        self.read("user_restriction", |s| {
            Ok(s.restrictions.contains(&(user, key.to_string())))
        })
    }

    fn set_user_restriction(&self, key: &str, user: UserId, value: bool) -> crate::Result<()> {
        self.mutate(
            "set_user_restriction",
            format!("set_user_restriction {} {} {}", key, user, value),
            |inner| {
                if value {
                    inner.state.restrictions.insert((user, key.to_string()));
                } else {
                    inner.state.restrictions.remove(&(user, key.to_string()));
                }
                Ok(())
            },
        )
    }

    fn global_setting(&self, key: &str) -> crate::Result<Option<String>> {
        self.read("global_setting", |s| Ok(s.settings.get(key).cloned()))
    }

    fn put_global_setting(&self, key: &str, value: &str) -> crate::Result<()> {
        self.mutate(
            "put_global_setting",
            format!("put_global_setting {} {}", key, value),
            |inner| {
                inner.state.settings.insert(key.into(), value.into());
                Ok(())
            },
        )
    }

    fn delete_global_setting(&self, key: &str) -> crate::Result<()> {
        self.mutate(
            "delete_global_setting",
            format!("delete_global_setting {}", key),
            |inner| {
                inner.state.settings.remove(key);
                Ok(())
            },
        )
    }

    fn secure_setting(&self, key: &str, user: UserId) -> crate::Result<Option<String>> {
        self.read("secure_setting", |s| {
            Ok(s.secure_settings.get(&(user, key.to_string())).cloned())
        })
    }

    fn put_secure_setting(&self, key: &str, user: UserId, value: &str) -> crate::Result<()> {
        self.mutate(
            "put_secure_setting",
            format!("put_secure_setting {} {} {}", key, user, value),
            |inner| {
                if !inner.state.users.iter().any(|u| u.id == user) {
                    return Err(fatal("put_secure_setting", format!("no user {}", user)));
                }
                inner
                    .state
                    .secure_settings
                    .insert((user, key.into()), value.into());
                Ok(())
            },
        )
    }

    fn delete_secure_setting(&self, key: &str, user: UserId) -> crate::Result<()> {
        self.mutate(
            "delete_secure_setting",
            format!("delete_secure_setting {} {}", key, user),
            |inner| {
                inner.state.secure_settings.remove(&(user, key.to_string()));
                Ok(())
            },
        )
    }

    fn delegated_scopes(&self, _admin: &str, package: &str, user: UserId) -> crate::Result<Vec<String>> {
        self.read("delegated_scopes", |s| {
            Ok(s.delegations
                .get(&(user, package.to_string()))
                .cloned()
                .unwrap_or_default())
        })
    }

    fn set_delegated_scopes(
        &self,
        admin: &str,
        package: &str,
        user: UserId,
        scopes: &[String],
    ) -> crate::Result<()> {
        self.mutate(
            "set_delegated_scopes",
            format!("set_delegated_scopes {} {} [{}]", package, user, scopes.join(",")),
            |inner| {
                let s = &mut inner.state;
                if !s.owners.iter().any(|o| o.component == admin) {
                    return Err(fatal("set_delegated_scopes", "not an owner"));
                }
                if scopes.is_empty() {
                    s.delegations.remove(&(user, package.to_string()));
                } else {
                    s.delegations
                        .insert((user, package.to_string()), scopes.to_vec());
                }
                Ok(())
            },
        )
    }
}
