//! The built in precondition handlers.
//!
//! Every handler first looks at what is already on the device and only
//! changes what differs, recording a [Revert] for each change. All kinds
//! share [undo] since a [Revert] already says exactly what to do.

use std::sync::Arc;

use log::{debug, info};

use crate::applier::{AdminInfo, InstalledApp, Provisioner, Revert};
use crate::device::{Owner, OwnerKind, UserInfo, SYSTEM_USER};
use crate::precondition::{
    Precondition, PreconditionKind, PreconditionRequest, Requirement, UserId, UserSelector,
};
use crate::registry::{Handler, UndoFn};
use crate::testapp::{TestApp, TestAppQuery};

pub const WORK_PROFILE_NAME: &str = "Work profile";
pub const ADDITIONAL_USER_NAME: &str = "Additional user";

/// Every built in kind with its handler
pub fn defaults() -> Vec<(PreconditionKind, Handler)> {
    let undo: UndoFn = Arc::new(undo);
    vec![
        (
            PreconditionKind::DeviceOwner,
            Handler::new(Arc::new(device_owner), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::ProfileOwner,
            Handler::new(Arc::new(profile_owner), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::WorkProfile,
            Handler::new(Arc::new(work_profile), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::AdditionalUser,
            Handler::new(Arc::new(additional_user), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::UserRestriction,
            Handler::new(Arc::new(user_restriction), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::TestAppInstalled,
            Handler::new(Arc::new(test_app_installed), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::Delegate,
            Handler::new(Arc::new(delegate), Arc::clone(&undo)).supporting(&[Requirement::Present]),
        ),
        (
            PreconditionKind::GlobalSetting,
            Handler::new(Arc::new(global_setting), Arc::clone(&undo)),
        ),
        (
            PreconditionKind::SecureSetting,
            Handler::new(Arc::new(secure_setting), undo),
        ),
    ]
}

fn mismatch(req: &PreconditionRequest) -> crate::Error {
    crate::Error::new_generic(&format!(
        "handler for {} given {:?}",
        req.kind(),
        req.precondition
    ))
}

fn fatal(operation: &str, message: String) -> crate::Error {
    crate::Error::FatalProvisioning {
        operation: operation.into(),
        message,
    }
}

/// Admin queries only ever match apps with an admin receiver
fn admin_query(query: &TestAppQuery) -> TestAppQuery {
    let mut q = query.clone();
    q.is_device_admin.get_or_insert(true);
    q
}

fn admin_component(app: &TestApp) -> crate::Result<String> {
    app.admin_component().ok_or_else(|| {
        fatal(
            "select admin",
            format!("{} has no device admin receiver", app.package_name()),
        )
    })
}

fn ensure_installed(p: &mut Provisioner<'_>, app: &TestApp, user: UserId) -> crate::Result<()> {
    let package = app.package_name();
    if p.call("is installed", |d| d.is_installed(package, user))? {
        debug!("{} already installed for user {}", package, user);
        return Ok(());
    }
    p.call("install", |d| d.install(app.apk_path(), user))?;
    p.record(Revert::Uninstall {
        package: package.into(),
        user,
    });
    Ok(())
}

fn remove_owner(p: &mut Provisioner<'_>, owner: &Owner) -> crate::Result<()> {
    info!("removing {} {}", owner.kind, owner.component);
    p.call("remove active admin", |d| {
        d.remove_active_admin(&owner.component, owner.user)
    })?;
    p.record(match owner.kind {
        OwnerKind::DeviceOwner => Revert::RestoreDeviceOwner {
            component: owner.component.clone(),
            user: owner.user,
        },
        OwnerKind::ProfileOwner => Revert::RestoreProfileOwner {
            component: owner.component.clone(),
            user: owner.user,
        },
    });
    Ok(())
}

/// Whether `owner` is a catalog app satisfying `query`
fn owner_matches(p: &Provisioner<'_>, owner: &Owner, query: &TestAppQuery) -> crate::Result<bool> {
    Ok(p
        .catalog()
        .entries()?
        .iter()
        .any(|e| e.package_name == owner.package() && query.matches(e)))
}

fn set_owner_state(p: &mut Provisioner<'_>, req: &PreconditionRequest, kind: OwnerKind, admin: AdminInfo) {
    let state = p.state_mut();
    if req.is_primary {
        state.primary = Some(admin.clone());
    }
    match kind {
        OwnerKind::DeviceOwner => state.device_owner = Some(admin),
        OwnerKind::ProfileOwner => {
            state.profile_owners.insert(admin.user, admin);
        }
    }
}

fn ensure_owner(
    p: &mut Provisioner<'_>,
    req: &PreconditionRequest,
    kind: OwnerKind,
    query: &TestAppQuery,
) -> crate::Result<()> {
    let user = match kind {
        OwnerKind::DeviceOwner => SYSTEM_USER,
        OwnerKind::ProfileOwner => p.user_id(req.effective_target())?,
    };
    let current = p
        .call("list owners", |d| d.owners())?
        .into_iter()
        .find(|o| o.kind == kind && (kind == OwnerKind::DeviceOwner || o.user == user));

    if req.requirement == Requirement::Absent {
        if let Some(owner) = current {
            remove_owner(p, &owner)?;
        }
        let state = p.state_mut();
        match kind {
            OwnerKind::DeviceOwner => state.device_owner = None,
            OwnerKind::ProfileOwner => {
                state.profile_owners.remove(&user);
            }
        }
        return Ok(());
    }

    let query = admin_query(query);

    if let Some(owner) = current {
        if owner_matches(p, &owner, &query)? {
            debug!("keeping existing {} {}", kind, owner.component);
            p.catalog().mark_used(owner.package())?;
            let package = owner.package().to_string();
            let admin = AdminInfo {
                component: owner.component,
                package,
                user: owner.user,
            };
            set_owner_state(p, req, kind, admin);
            return Ok(());
        }
        remove_owner(p, &owner)?;
    }

    let app = p.catalog().get(&query)?;
    let component = admin_component(&app)?;
    ensure_installed(p, &app, user)?;

    info!("setting {} {} for user {}", kind, component, user);
    match kind {
        OwnerKind::DeviceOwner => {
            p.call("set device owner", |d| d.set_device_owner(&component, user))?;
            p.record(Revert::RemoveDeviceOwner {
                component: component.clone(),
                user,
            });
        }
        OwnerKind::ProfileOwner => {
            p.call("set profile owner", |d| d.set_profile_owner(&component, user))?;
            p.record(Revert::RemoveProfileOwner {
                component: component.clone(),
                user,
            });
        }
    }

    let admin = AdminInfo {
        component,
        package: app.package_name().into(),
        user,
    };
    set_owner_state(p, req, kind, admin);
    Ok(())
}

fn device_owner(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    match &req.precondition {
        Precondition::DeviceOwner { query } => ensure_owner(p, req, OwnerKind::DeviceOwner, query),
        _ => Err(mismatch(req)),
    }
}

fn profile_owner(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    match &req.precondition {
        Precondition::ProfileOwner { query } => ensure_owner(p, req, OwnerKind::ProfileOwner, query),
        _ => Err(mismatch(req)),
    }
}

fn remove_users(
    p: &mut Provisioner<'_>,
    users: Vec<UserInfo>,
    selector: UserSelector,
) -> crate::Result<()> {
    for u in users {
        info!("removing user {} ({})", u.id, u.name);
        p.call("remove user", |d| d.remove_user(u.id))?;
        p.record(Revert::RecreateUser {
            name: u.name,
            profile_of: u.parent,
            selector,
        });
    }
    p.state_mut().users.remove(&selector);
    Ok(())
}

fn create_user(
    p: &mut Provisioner<'_>,
    name: &str,
    profile_of: Option<UserId>,
    selector: UserSelector,
) -> crate::Result<UserId> {
    let id = p.call("create user", |d| d.create_user(name, profile_of))?;
    info!("created user {} ({})", id, name);
    p.record(Revert::RemoveUser { user: id, selector });
    Ok(id)
}

fn work_profile(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let parent = p.user_id(req.effective_target())?;
    let existing: Vec<UserInfo> = p
        .call("list users", |d| d.users())?
        .into_iter()
        .filter(|u| u.is_managed_profile() && u.parent == Some(parent))
        .collect();

    match req.requirement {
        Requirement::Present => {
            let id = match existing.first() {
                Some(u) => u.id,
                None => create_user(p, WORK_PROFILE_NAME, Some(parent), UserSelector::WorkProfile)?,
            };
            p.state_mut().users.insert(UserSelector::WorkProfile, id);
            Ok(())
        }
        Requirement::Absent => remove_users(p, existing, UserSelector::WorkProfile),
    }
}

fn additional_user(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let instrumented = p.user_id(UserSelector::Instrumented)?;
    let existing: Vec<UserInfo> = p
        .call("list users", |d| d.users())?
        .into_iter()
        .filter(|u| {
            !u.is_system() && !u.is_managed_profile() && u.parent.is_none() && u.id != instrumented
        })
        .collect();

    match req.requirement {
        Requirement::Present => {
            let id = match existing.first() {
                Some(u) => u.id,
                None => create_user(p, ADDITIONAL_USER_NAME, None, UserSelector::Additional)?,
            };
            p.state_mut().users.insert(UserSelector::Additional, id);
            Ok(())
        }
        Requirement::Absent => remove_users(p, existing, UserSelector::Additional),
    }
}

fn user_restriction(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let Precondition::UserRestriction { key } = &req.precondition else {
        return Err(mismatch(req));
    };
    let user = p.user_id(req.effective_target())?;
    let wanted = req.requirement == Requirement::Present;
    let current = p.call("get user restriction", |d| d.user_restriction(key, user))?;
    if current == wanted {
        return Ok(());
    }
    p.call("set user restriction", |d| {
        d.set_user_restriction(key, user, wanted)
    })?;
    p.record(Revert::SetRestriction {
        key: key.clone(),
        user,
        value: current,
    });
    Ok(())
}

fn test_app_installed(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let Precondition::TestAppInstalled { key, query } = &req.precondition else {
        return Err(mismatch(req));
    };
    let user = p.user_id(req.effective_target())?;
    // Absent apps come from the catalog too so they can be reinstalled
    let app = p.catalog().get(query)?;
    let package = app.package_name().to_string();
    let key = key.clone().unwrap_or_else(|| package.clone());

    match req.requirement {
        Requirement::Present => {
            ensure_installed(p, &app, user)?;
            let installed = InstalledApp {
                key: key.clone(),
                package,
                user,
                admin_component: app.admin_component(),
            };
            p.state_mut().test_apps.insert(key, installed);
        }
        Requirement::Absent => {
            if p.call("is installed", |d| d.is_installed(&package, user))? {
                p.call("uninstall", |d| d.uninstall(&package, user))?;
                p.record(Revert::Reinstall {
                    package,
                    apk: app.apk_path().to_path_buf(),
                    user,
                });
            }
            p.state_mut().test_apps.remove(&key);
        }
    }
    Ok(())
}

/// The admin delegating to test apps: the primary one, else the device
/// owner, else any profile owner this fixture set, else whatever owner the
/// device already had
fn delegating_admin(p: &Provisioner<'_>) -> crate::Result<AdminInfo> {
    let state = p.state();
    let known = state
        .primary
        .clone()
        .or_else(|| state.device_owner.clone())
        .or_else(|| state.profile_owners.values().next().cloned());
    if let Some(admin) = known {
        return Ok(admin);
    }
    let owner = p
        .call("list owners", |d| d.owners())?
        .into_iter()
        .next()
        .ok_or_else(|| fatal("delegate", "no device or profile owner to delegate from".into()))?;
    let package = owner.package().to_string();
    Ok(AdminInfo {
        component: owner.component,
        package,
        user: owner.user,
    })
}

fn delegate(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let Precondition::Delegate { test_app, scopes } = &req.precondition else {
        return Err(mismatch(req));
    };
    let admin = delegating_admin(p)?;
    let package = p
        .state()
        .test_apps
        .get(test_app)
        .map(|a| a.package.clone())
        .unwrap_or_else(|| test_app.clone());

    let previous = p.call("get delegated scopes", |d| {
        d.delegated_scopes(&admin.component, &package, admin.user)
    })?;
    if previous == *scopes {
        debug!("{} already has [{}]", package, scopes.join(","));
        return Ok(());
    }

    info!(
        "delegating [{}] from {} to {}",
        scopes.join(","),
        admin.component,
        package
    );
    p.call("set delegated scopes", |d| {
        d.set_delegated_scopes(&admin.component, &package, admin.user, scopes)
    })?;
    p.record(Revert::SetDelegatedScopes {
        admin: admin.component,
        package,
        user: admin.user,
        scopes: previous,
    });
    Ok(())
}

/// Where a setting lives: the device wide `global` table or a user's
/// `secure` table
#[derive(Clone, Copy)]
enum SettingTable {
    Global,
    Secure(UserId),
}

impl SettingTable {
    fn get(self, p: &Provisioner<'_>, key: &str) -> crate::Result<Option<String>> {
        match self {
            Self::Global => p.call("get global setting", |d| d.global_setting(key)),
            Self::Secure(user) => p.call("get secure setting", |d| d.secure_setting(key, user)),
        }
    }

    fn put(self, p: &Provisioner<'_>, key: &str, value: &str) -> crate::Result<()> {
        match self {
            Self::Global => p.call("put global setting", |d| d.put_global_setting(key, value)),
            Self::Secure(user) => p.call("put secure setting", |d| {
                d.put_secure_setting(key, user, value)
            }),
        }
    }

    fn delete(self, p: &Provisioner<'_>, key: &str) -> crate::Result<()> {
        match self {
            Self::Global => p.call("delete global setting", |d| d.delete_global_setting(key)),
            Self::Secure(user) => p.call("delete secure setting", |d| {
                d.delete_secure_setting(key, user)
            }),
        }
    }

    fn restore(self, p: &Provisioner<'_>, key: &str, previous: Option<&str>) -> crate::Result<()> {
        match previous {
            Some(v) => self.put(p, key, v),
            None => self.delete(p, key),
        }
    }

    fn revert(self, key: &str, previous: Option<String>) -> Revert {
        match self {
            Self::Global => Revert::RestoreGlobalSetting {
                key: key.into(),
                previous,
            },
            Self::Secure(user) => Revert::RestoreSecureSetting {
                key: key.into(),
                user,
                previous,
            },
        }
    }
}

fn ensure_setting(
    p: &mut Provisioner<'_>,
    req: &PreconditionRequest,
    table: SettingTable,
    key: &str,
    value: Option<&str>,
) -> crate::Result<()> {
    let previous = table.get(p, key)?;

    match req.requirement {
        Requirement::Present => {
            let value = value.ok_or_else(|| {
                crate::Error::new_plan(&format!("{} needs a value", req.identity()))
            })?;
            if previous.as_deref() == Some(value) {
                return Ok(());
            }
            table.put(p, key, value)?;
        }
        Requirement::Absent => {
            if previous.is_none() {
                return Ok(());
            }
            table.delete(p, key)?;
        }
    }
    p.record(table.revert(key, previous));
    Ok(())
}

fn global_setting(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let Precondition::GlobalSetting { key, value } = &req.precondition else {
        return Err(mismatch(req));
    };
    ensure_setting(p, req, SettingTable::Global, key, value.as_deref())
}

fn secure_setting(p: &mut Provisioner<'_>, req: &PreconditionRequest) -> crate::Result<()> {
    let Precondition::SecureSetting { key, value } = &req.precondition else {
        return Err(mismatch(req));
    };
    let user = p.user_id(req.effective_target())?;
    ensure_setting(p, req, SettingTable::Secure(user), key, value.as_deref())
}

/// Reverse a single recorded change
pub fn undo(p: &mut Provisioner<'_>, revert: &Revert) -> crate::Result<()> {
    match revert {
        Revert::Uninstall { package, user } => p.call("uninstall", |d| d.uninstall(package, *user)),
        Revert::Reinstall { apk, user, .. } => p.call("install", |d| d.install(apk, *user)),
        Revert::RemoveDeviceOwner { component, user } => {
            p.call("remove active admin", |d| {
                d.remove_active_admin(component, *user)
            })?;
            let state = p.state_mut();
            if state.device_owner.as_ref().map(|a| &a.component) == Some(component) {
                state.device_owner = None;
            }
            if state.primary.as_ref().map(|a| &a.component) == Some(component) {
                state.primary = None;
            }
            Ok(())
        }
        Revert::RemoveProfileOwner { component, user } => {
            p.call("remove active admin", |d| {
                d.remove_active_admin(component, *user)
            })?;
            let state = p.state_mut();
            state.profile_owners.remove(user);
            if state.primary.as_ref().map(|a| &a.component) == Some(component) {
                state.primary = None;
            }
            Ok(())
        }
        Revert::RestoreDeviceOwner { component, user } => {
            p.call("set device owner", |d| d.set_device_owner(component, *user))
        }
        Revert::RestoreProfileOwner { component, user } => {
            p.call("set profile owner", |d| d.set_profile_owner(component, *user))
        }
        Revert::RemoveUser { user, selector } => {
            p.call("remove user", |d| d.remove_user(*user))?;
            let users = &mut p.state_mut().users;
            if users.get(selector) == Some(user) {
                users.remove(selector);
            }
            Ok(())
        }
        Revert::RecreateUser {
            name,
            profile_of,
            selector,
        } => {
            let id = p.call("create user", |d| d.create_user(name, *profile_of))?;
            info!("recreated user {} as {}", name, id);
            p.state_mut().users.insert(*selector, id);
            Ok(())
        }
        Revert::SetRestriction { key, user, value } => p.call("set user restriction", |d| {
            d.set_user_restriction(key, *user, *value)
        }),
        Revert::RestoreGlobalSetting { key, previous } => {
            SettingTable::Global.restore(p, key, previous.as_deref())
        }
        Revert::RestoreSecureSetting {
            key,
            user,
            previous,
        } => SettingTable::Secure(*user).restore(p, key, previous.as_deref()),
        Revert::SetDelegatedScopes {
            admin,
            package,
            user,
            scopes,
        } => p.call("set delegated scopes", |d| {
            d.set_delegated_scopes(admin, package, *user, scopes)
        }),
    }
}
