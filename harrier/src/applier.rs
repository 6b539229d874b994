//! Executes a resolved plan against a device.
//!
//! Every change a handler makes is recorded as a [Revert] on the
//! [Provisioner] so a successful action becomes one
//! [AppliedStateHandle](crate::teardown::AppliedStateHandle), and a failed
//! one can be rolled back before the earlier actions are unwound.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use serde::Serialize;

use crate::config::RetryConfig;
use crate::device::{Device, SYSTEM_USER};
use crate::errors::UndoFailure;
use crate::events::{EventMonitor, FixtureEvent};
use crate::precondition::{FailureMode, PreconditionRequest, UserId, UserSelector};
use crate::registry::AnnotationRegistry;
use crate::resolver::ResolvedPlan;
use crate::teardown::{AppliedStateHandle, TeardownScheduler};
use crate::testapp::TestAppProvider;

/// A primitive change that undoes one step of applying a precondition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revert {
    Uninstall {
        package: String,
        user: UserId,
    },
    Reinstall {
        package: String,
        apk: PathBuf,
        user: UserId,
    },
    RemoveDeviceOwner {
        component: String,
        user: UserId,
    },
    RestoreDeviceOwner {
        component: String,
        user: UserId,
    },
    RemoveProfileOwner {
        component: String,
        user: UserId,
    },
    RestoreProfileOwner {
        component: String,
        user: UserId,
    },
    RemoveUser {
        user: UserId,
        selector: UserSelector,
    },
    /// Removed users come back with a new id
    RecreateUser {
        name: String,
        profile_of: Option<UserId>,
        selector: UserSelector,
    },
    SetRestriction {
        key: String,
        user: UserId,
        value: bool,
    },
    RestoreGlobalSetting {
        key: String,
        previous: Option<String>,
    },
    RestoreSecureSetting {
        key: String,
        user: UserId,
        previous: Option<String>,
    },
    SetDelegatedScopes {
        admin: String,
        package: String,
        user: UserId,
        scopes: Vec<String>,
    },
}

impl Display for Revert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninstall { package, user } => write!(f, "uninstall {} for user {}", package, user),
            Self::Reinstall { package, user, .. } => {
                write!(f, "reinstall {} for user {}", package, user)
            }
            Self::RemoveDeviceOwner { component, .. } => {
                write!(f, "remove device owner {}", component)
            }
            Self::RestoreDeviceOwner { component, .. } => {
                write!(f, "restore device owner {}", component)
            }
            Self::RemoveProfileOwner { component, user } => {
                write!(f, "remove profile owner {} of user {}", component, user)
            }
            Self::RestoreProfileOwner { component, user } => {
                write!(f, "restore profile owner {} of user {}", component, user)
            }
            Self::RemoveUser { user, .. } => write!(f, "remove user {}", user),
            Self::RecreateUser { name, .. } => write!(f, "recreate user {}", name),
            Self::SetRestriction { key, user, value } => {
                write!(f, "set restriction {} for user {} to {}", key, user, value)
            }
            Self::RestoreGlobalSetting { key, previous } => match previous {
                Some(v) => write!(f, "restore global setting {}={}", key, v),
                None => write!(f, "delete global setting {}", key),
            },
            Self::RestoreSecureSetting {
                key,
                user,
                previous,
            } => match previous {
                Some(v) => write!(f, "restore secure setting {}={} for user {}", key, v, user),
                None => write!(f, "delete secure setting {} for user {}", key, user),
            },
            Self::SetDelegatedScopes {
                package, scopes, ..
            } => write!(f, "set delegated scopes of {} to [{}]", package, scopes.join(",")),
        }
    }
}

/// An admin picked from the catalog and made device or profile owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminInfo {
    pub component: String,
    pub package: String,
    pub user: UserId,
}

/// A test app installed for the current test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledApp {
    pub key: String,
    pub package: String,
    pub user: UserId,
    pub admin_component: Option<String>,
}

/// What applying the plan selected or created, handed to the test body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixtureState {
    pub instrumented: Option<UserId>,
    pub users: BTreeMap<UserSelector, UserId>,
    pub device_owner: Option<AdminInfo>,
    pub profile_owners: BTreeMap<UserId, AdminInfo>,
    pub primary: Option<AdminInfo>,
    pub test_apps: BTreeMap<String, InstalledApp>,
}

/// Everything a handler needs while applying or undoing a precondition
pub struct Provisioner<'a> {
    device: &'a dyn Device,
    catalog: &'a TestAppProvider,
    retry: &'a RetryConfig,
    monitor: &'a dyn EventMonitor<FixtureEvent>,
    state: FixtureState,
    reverts: Vec<Revert>,
    action: String,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        device: &'a dyn Device,
        catalog: &'a TestAppProvider,
        retry: &'a RetryConfig,
        monitor: &'a dyn EventMonitor<FixtureEvent>,
    ) -> Self {
        Self {
            device,
            catalog,
            retry,
            monitor,
            state: FixtureState::default(),
            reverts: Vec::new(),
            action: String::new(),
        }
    }

    pub fn with_instrumented_user(mut self, user: Option<UserId>) -> Self {
        self.state.instrumented = user;
        self
    }

    #[inline]
    pub fn device(&self) -> &'a dyn Device {
        self.device
    }

    #[inline]
    pub fn catalog(&self) -> &'a TestAppProvider {
        self.catalog
    }

    #[inline]
    pub fn state(&self) -> &FixtureState {
        &self.state
    }

    #[inline]
    pub fn state_mut(&mut self) -> &mut FixtureState {
        &mut self.state
    }

    pub fn into_state(self) -> FixtureState {
        self.state
    }

    pub(crate) fn emit(&self, evt: FixtureEvent) {
        self.monitor.on_event(evt);
    }

    pub(crate) fn begin(&mut self, action: String) {
        self.action = action;
    }

    /// Record how to undo a change that was just made
    pub fn record(&mut self, revert: Revert) {
        debug!("{}: will {} on undo", self.action, revert);
        self.reverts.push(revert);
    }

    pub(crate) fn take_reverts(&mut self) -> Vec<Revert> {
        std::mem::take(&mut self.reverts)
    }

    /// Run a device operation, retrying transient failures with exponential
    /// backoff. Anything else, including timeouts, fails immediately.
    pub fn call<R>(
        &self,
        operation: &str,
        mut f: impl FnMut(&dyn Device) -> crate::Result<R>,
    ) -> crate::Result<R> {
        let max = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(self.device) {
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "{} failed ({}), attempt {}/{}, retrying in {:?}",
                        operation, e, attempt, max, delay
                    );
                    self.emit(FixtureEvent::Retrying {
                        action: self.action.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                res => return res,
            }
        }
    }

    /// The numeric id `selector` currently refers to
    pub fn user_id(&mut self, selector: UserSelector) -> crate::Result<UserId> {
        match selector {
            UserSelector::System => Ok(SYSTEM_USER),
            UserSelector::Instrumented => {
                if let Some(id) = self.state.instrumented {
                    return Ok(id);
                }
                let id = self.call("current user", |d| d.current_user())?;
                self.state.instrumented = Some(id);
                Ok(id)
            }
            UserSelector::WorkProfile | UserSelector::Additional => {
                if let Some(id) = self.state.users.get(&selector) {
                    return Ok(*id);
                }
                let id = self
                    .find_user(selector)?
                    .ok_or(crate::Error::NoSuchUser(selector))?;
                self.state.users.insert(selector, id);
                Ok(id)
            }
        }
    }

    /// Look for an existing user on the device matching `selector`, without
    /// consulting what this fixture already knows
    pub fn find_user(&mut self, selector: UserSelector) -> crate::Result<Option<UserId>> {
        let instrumented = self.user_id(UserSelector::Instrumented)?;
        let users = self.call("list users", |d| d.users())?;
        Ok(match selector {
            UserSelector::System => Some(SYSTEM_USER),
            UserSelector::Instrumented => Some(instrumented),
            UserSelector::WorkProfile => users
                .iter()
                .find(|u| u.is_managed_profile() && u.parent == Some(instrumented))
                .map(|u| u.id),
            UserSelector::Additional => users
                .iter()
                .find(|u| {
                    !u.is_system() && !u.is_managed_profile() && u.parent.is_none() && u.id != instrumented
                })
                .map(|u| u.id),
        })
    }
}

pub struct StateApplier<'r> {
    registry: &'r AnnotationRegistry,
}

impl<'r> StateApplier<'r> {
    pub fn new(registry: &'r AnnotationRegistry) -> Self {
        Self { registry }
    }

    /// Apply every action of `plan` in order, returning one handle per action.
    ///
    /// Either every action is applied or, on failure, everything that was
    /// applied has been undone and [crate::Error::SetupFailed] is returned.
    pub fn apply(
        &self,
        plan: &ResolvedPlan,
        p: &mut Provisioner<'_>,
    ) -> crate::Result<TeardownScheduler> {
        let mut scheduler = TeardownScheduler::new();

        for action in &plan.actions {
            let request = &action.request;
            let req = request.as_ref();
            let description = req.describe();
            p.begin(description.clone());
            p.emit(FixtureEvent::Applying {
                action: description.clone(),
            });
            debug!("applying {}", description);

            let handler = match self.registry.lookup(req.kind()) {
                Ok(h) => h,
                Err(e) => return Err(fail(p, req, e, Vec::new(), scheduler)),
            };

            let res = (handler.apply)(p, req);
            let handle = AppliedStateHandle::new(
                Arc::clone(request),
                p.take_reverts(),
                Arc::clone(&handler.undo),
            );

            match res {
                Ok(()) => {
                    p.emit(FixtureEvent::Applied {
                        action: description,
                    });
                    scheduler.push(handle);
                }
                Err(e) => {
                    // Changes the failed action already made go first
                    let partial = if handle.is_empty() {
                        Vec::new()
                    } else {
                        debug!("rolling back partial {}", handle);
                        handle.undo(p)
                    };
                    return Err(fail(p, req, e, partial, scheduler));
                }
            }
        }

        Ok(scheduler)
    }
}

/// Unwind everything applied so far and build the error for a failed action
fn fail(
    p: &mut Provisioner<'_>,
    req: &PreconditionRequest,
    source: crate::Error,
    mut unwind_failures: Vec<UndoFailure>,
    mut applied: TeardownScheduler,
) -> crate::Error {
    let description = req.describe();
    log::error!("failed to apply {}: {}", description, source);
    p.emit(FixtureEvent::ApplyFailed {
        action: description,
        error: source.to_string(),
    });
    unwind_failures.extend(applied.teardown(p));
    crate::Error::SetupFailed {
        kind: req.kind(),
        target: req.effective_target(),
        source: Box::new(source),
        unwind_failures,
        skip: req.failure_mode == FailureMode::Skip,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::ChannelEventMonitor;
    use crate::precondition::{priority, Precondition};
    use crate::registry;
    use crate::resolver::Resolver;
    use crate::testapp::TestAppQuery;
    use crate::testing::*;
    use rstest::*;

    fn plan(reqs: Vec<PreconditionRequest>) -> ResolvedPlan {
        Resolver::new(registry::global()).resolve(reqs).unwrap()
    }

    fn restriction(key: &str) -> PreconditionRequest {
        PreconditionRequest::new(Precondition::UserRestriction { key: key.into() })
    }

    fn apply(p: &mut Provisioner<'_>, reqs: Vec<PreconditionRequest>) -> crate::Result<TeardownScheduler> {
        StateApplier::new(registry::global()).apply(&plan(reqs), p)
    }

    #[rstest]
    fn test_failed_setup_leaves_device_untouched(
        fake_device: FakeDevice,
        sample_provider: TestAppProvider,
    ) {
        fake_device.fail_always("set_profile_owner", FailKind::Fatal);
        let initial = fake_device.state();
        let mut p = provisioner(&fake_device, &sample_provider);

        let reqs = vec![
            PreconditionRequest::new(Precondition::TestAppInstalled {
                key: None,
                query: TestAppQuery::builder()
                    .where_package_name()
                    .is_equal_to(EMPTY_APP)
                    .build(),
            })
            .with_priority(priority::FIRST),
            PreconditionRequest::new(Precondition::ProfileOwner {
                query: TestAppQuery::default(),
            }),
            restriction("no_add_user"),
        ];

        let err = apply(&mut p, reqs).err().unwrap();
        match &err {
            crate::Error::SetupFailed {
                kind,
                unwind_failures,
                skip,
                ..
            } => {
                assert_eq!(*kind, crate::precondition::PreconditionKind::ProfileOwner);
                assert!(unwind_failures.is_empty());
                assert!(!skip);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fake_device.state(), initial);
        assert_eq!(
            fake_device.calls(),
            vec![
                format!("install {} 0", EMPTY_APP),
                format!("install {} 0", DEVICE_ADMIN_APP),
                format!("uninstall {} 0", DEVICE_ADMIN_APP),
                format!("uninstall {} 0", EMPTY_APP),
            ]
        );
    }

    #[rstest]
    fn test_transient_failures_retried(fake_device: FakeDevice, sample_provider: TestAppProvider) {
        fake_device.fail_times("set_user_restriction", FailKind::Transient, 2);
        let (mon, rx) = ChannelEventMonitor::create();
        let mut p = Provisioner::new(&fake_device, &sample_provider, &FAST_RETRY, &mon);

        let mut sched = apply(&mut p, vec![restriction("no_add_user")]).unwrap();
        assert_eq!(sched.len(), 1);
        assert!(fake_device
            .state()
            .restrictions
            .contains(&(0, "no_add_user".to_string())));

        let retries = rx
            .try_iter()
            .filter(|e| matches!(e, FixtureEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);

        assert!(sched.teardown(&mut p).is_empty());
        assert!(fake_device.state().restrictions.is_empty());
    }

    #[rstest]
    fn test_retries_bounded(fake_device: FakeDevice, sample_provider: TestAppProvider) {
        fake_device.fail_times("set_user_restriction", FailKind::Transient, 3);
        let mut p = provisioner(&fake_device, &sample_provider);

        let err = apply(&mut p, vec![restriction("no_add_user")]).err().unwrap();
        match err {
            crate::Error::SetupFailed { source, .. } => assert!(source.is_transient()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest]
    fn test_timeout_not_retried(fake_device: FakeDevice, sample_provider: TestAppProvider) {
        fake_device.fail_times("create_user", FailKind::Timeout, 1);
        let mut p = provisioner(&fake_device, &sample_provider);

        let err = apply(&mut p, vec![PreconditionRequest::new(Precondition::WorkProfile)])
            .err()
            .unwrap();
        assert!(matches!(
            err,
            crate::Error::SetupFailed { ref source, .. }
                if matches!(**source, crate::Error::CommandTimeout(..))
        ));
        assert_eq!(fake_device.state().users.len(), 1);
    }

    #[rstest]
    fn test_unwind_failures_reported(fake_device: FakeDevice, sample_provider: TestAppProvider) {
        fake_device.fail_always("put_global_setting", FailKind::Fatal);
        fake_device.fail_always("remove_user", FailKind::Fatal);
        let mut p = provisioner(&fake_device, &sample_provider);

        let reqs = vec![
            PreconditionRequest::new(Precondition::WorkProfile),
            PreconditionRequest::new(Precondition::GlobalSetting {
                key: "adb_enabled".into(),
                value: Some("1".into()),
            })
            .skip_on_failure(),
        ];
        let err = apply(&mut p, reqs).err().unwrap();

        assert!(err.is_skip());
        let failures = err.undo_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].kind,
            crate::precondition::PreconditionKind::WorkProfile
        );
    }

    #[rstest]
    fn test_user_resolution(fake_device: FakeDevice, sample_provider: TestAppProvider) {
        fake_device.with_state(|s| {
            s.users.push(crate::device::UserInfo {
                id: 12,
                name: "Work".into(),
                user_type: crate::device::MANAGED_PROFILE_TYPE.into(),
                parent: Some(0),
            })
        });
        let mut p = provisioner(&fake_device, &sample_provider);

        assert_eq!(p.user_id(UserSelector::System).unwrap(), 0);
        assert_eq!(p.user_id(UserSelector::Instrumented).unwrap(), 0);
        assert_eq!(p.user_id(UserSelector::WorkProfile).unwrap(), 12);
        assert!(matches!(
            p.user_id(UserSelector::Additional),
            Err(crate::Error::NoSuchUser(UserSelector::Additional))
        ));
    }
}
