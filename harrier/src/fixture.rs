//! Running a test body inside a resolved device state.
//!
//! [DeviceState] resolves a test's preconditions, applies them, hands the
//! body a [FixtureContext] and tears everything down afterwards, no matter
//! how the body finished. Only one test runs against a device at a time.

use std::any::Any;
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};

use crate::adb::ExecAdb;
use crate::applier::{AdminInfo, FixtureState, InstalledApp, Provisioner, StateApplier};
use crate::config::{HarnessConfig, RetryConfig};
use crate::context::Context;
use crate::device::{AdbDevice, Device, SYSTEM_USER};
use crate::errors::UndoFailure;
use crate::events::{EventMonitor, FixtureEvent, NoopMonitor};
use crate::precondition::{PreconditionRequest, UserId, UserSelector};
use crate::registry::{self, AnnotationRegistry};
use crate::resolver::{ResolvedPlan, Resolver};
use crate::teardown::TeardownGuard;
use crate::testapp::TestAppProvider;

/// What a test body can see of the state it runs in
pub struct FixtureContext<'a> {
    state: &'a FixtureState,
    device: &'a dyn Device,
    catalog: &'a TestAppProvider,
}

impl<'a> FixtureContext<'a> {
    pub fn device(&self) -> &'a dyn Device {
        self.device
    }

    pub fn catalog(&self) -> &'a TestAppProvider {
        self.catalog
    }

    pub fn state(&self) -> &'a FixtureState {
        self.state
    }

    /// The admin marked primary, or the only owner if there is just one
    pub fn primary(&self) -> Option<&'a AdminInfo> {
        if let Some(p) = &self.state.primary {
            return Some(p);
        }
        match (&self.state.device_owner, self.state.profile_owners.len()) {
            (Some(d), 0) => Some(d),
            (None, 1) => self.state.profile_owners.values().next(),
            _ => None,
        }
    }

    pub fn device_owner(&self) -> Option<&'a AdminInfo> {
        self.state.device_owner.as_ref()
    }

    pub fn profile_owner(&self, selector: UserSelector) -> Option<&'a AdminInfo> {
        let user = self.user(selector).ok()?;
        self.state.profile_owners.get(&user)
    }

    /// The numeric id of `selector`. Users the fixture neither created nor
    /// looked up are unknown.
    pub fn user(&self, selector: UserSelector) -> crate::Result<UserId> {
        match selector {
            UserSelector::System => Ok(SYSTEM_USER),
            UserSelector::Instrumented => match self.state.instrumented {
                Some(id) => Ok(id),
                None => self.device.current_user(),
            },
            _ => self
                .state
                .users
                .get(&selector)
                .copied()
                .ok_or(crate::Error::NoSuchUser(selector)),
        }
    }

    /// A test app installed by a `test-app-installed` precondition, by its key
    pub fn test_app(&self, key: &str) -> crate::Result<&'a InstalledApp> {
        self.state
            .test_apps
            .get(key)
            .ok_or_else(|| crate::Error::new_generic(&format!("no test app with key {}", key)))
    }
}

pub enum TestOutcome {
    Passed,
    Failed(anyhow::Error),
    Panicked(String),
    Skipped(String),
    SetupFailed(crate::Error),
}

impl TestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::Skipped(_) => "skipped",
            Self::SetupFailed(_) => "setup failed",
        }
    }
}

impl Display for TestOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed(e) => write!(f, "failed: {:#}", e),
            Self::Panicked(m) => write!(f, "panicked: {}", m),
            Self::Skipped(m) => write!(f, "skipped: {}", m),
            Self::SetupFailed(e) => write!(f, "setup failed: {}", e),
        }
    }
}

/// The result of one test together with anything that went wrong tearing
/// it down
pub struct TestRun {
    pub outcome: TestOutcome,
    pub teardown_failures: Vec<UndoFailure>,
}

impl TestRun {
    fn from_setup_error(err: crate::Error) -> Self {
        match err {
            crate::Error::SetupFailed {
                kind,
                target,
                source,
                unwind_failures,
                skip: true,
            } => Self {
                outcome: TestOutcome::Skipped(format!("{} for {} failed: {}", kind, target, source)),
                teardown_failures: unwind_failures,
            },
            err if err.is_skip() => Self {
                outcome: TestOutcome::Skipped(err.to_string()),
                teardown_failures: Vec::new(),
            },
            err => Self {
                outcome: TestOutcome::SetupFailed(err),
                teardown_failures: Vec::new(),
            },
        }
    }

    /// Every failed undo, from teardown or from unwinding a failed setup
    pub fn undo_failures(&self) -> Vec<&UndoFailure> {
        let mut all: Vec<&UndoFailure> = self.teardown_failures.iter().collect();
        if let TestOutcome::SetupFailed(e) = &self.outcome {
            all.extend(e.undo_failures());
        }
        all
    }

    /// Passed or skipped, and nothing was left behind on the device
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TestOutcome::Passed | TestOutcome::Skipped(_))
            && self.undo_failures().is_empty()
    }

    /// Collapse into a single result. Teardown failures are only the error
    /// when the test itself didn't fail.
    pub fn into_result(self) -> anyhow::Result<()> {
        let leftover = |failures: &[UndoFailure]| {
            for f in failures {
                error!("{}", f);
            }
        };
        match self.outcome {
            TestOutcome::Passed | TestOutcome::Skipped(_) => {
                if self.teardown_failures.is_empty() {
                    Ok(())
                } else {
                    Err(crate::Error::Teardown(self.teardown_failures).into())
                }
            }
            TestOutcome::Failed(e) => {
                leftover(&self.teardown_failures);
                Err(e)
            }
            TestOutcome::Panicked(m) => {
                leftover(&self.teardown_failures);
                Err(anyhow::anyhow!("test panicked: {}", m))
            }
            TestOutcome::SetupFailed(e) => {
                leftover(e.undo_failures());
                Err(e.into())
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// The harness owning a device and the test app catalog.
pub struct DeviceState {
    device: Arc<dyn Device>,
    catalog: TestAppProvider,
    registry: Cow<'static, AnnotationRegistry>,
    retry: RetryConfig,
    instrumented_user: Option<UserId>,
    monitor: Box<dyn EventMonitor<FixtureEvent>>,
    lock: Mutex<()>,
}

impl DeviceState {
    pub fn new(device: Arc<dyn Device>, catalog: TestAppProvider, cfg: &HarnessConfig) -> Self {
        Self {
            device,
            catalog,
            registry: Cow::Borrowed(registry::global()),
            retry: cfg.retry.clone(),
            instrumented_user: cfg.device.instrumented_user,
            monitor: Box::new(NoopMonitor::new()),
            lock: Mutex::new(()),
        }
    }

    /// A harness for the device and catalog configured for the project
    pub fn from_context(ctx: &dyn Context) -> crate::Result<Self> {
        let cfg = HarnessConfig::load(ctx)?;
        let adb = ExecAdb::new(ctx, &cfg.device)?;
        let device = AdbDevice::new(Box::new(adb), &cfg.retry);
        let catalog = TestAppProvider::from_config(&cfg.catalog, &ctx.get_project_dir()?);
        Ok(Self::new(Arc::new(device), catalog, &cfg))
    }

    pub fn with_registry(mut self, registry: AnnotationRegistry) -> Self {
        self.registry = Cow::Owned(registry);
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn EventMonitor<FixtureEvent>>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn catalog(&self) -> &TestAppProvider {
        &self.catalog
    }

    pub fn resolve(&self, requests: Vec<PreconditionRequest>) -> crate::Result<ResolvedPlan> {
        Resolver::new(&self.registry).resolve(requests)
    }

    /// Resolve `requests` and run `body` in the resulting state
    pub fn run_test<F>(&self, requests: Vec<PreconditionRequest>, body: F) -> TestRun
    where
        F: FnOnce(&FixtureContext<'_>) -> anyhow::Result<()>,
    {
        match self.resolve(requests) {
            Ok(plan) => self.run_plan(&plan, body),
            Err(e) => {
                warn!("failed to resolve preconditions: {}", e);
                self.finished(TestRun::from_setup_error(e))
            }
        }
    }

    pub fn run_plan<F>(&self, plan: &ResolvedPlan, body: F) -> TestRun
    where
        F: FnOnce(&FixtureContext<'_>) -> anyhow::Result<()>,
    {
        let _serial = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.monitor.on_event(FixtureEvent::TestStarted);

        if let Err(e) = self.catalog.snapshot() {
            return self.finished(TestRun::from_setup_error(e));
        }
        let run = self.run_locked(plan, body);
        if let Err(e) = self.catalog.restore() {
            error!("failed to restore test app catalog: {}", e);
        }
        self.finished(run)
    }

    fn finished(&self, run: TestRun) -> TestRun {
        info!("test {}", run.outcome.label());
        self.monitor.on_event(FixtureEvent::TestFinished {
            outcome: run.outcome.label().into(),
        });
        run
    }

    fn run_locked<F>(&self, plan: &ResolvedPlan, body: F) -> TestRun
    where
        F: FnOnce(&FixtureContext<'_>) -> anyhow::Result<()>,
    {
        let mut p = Provisioner::new(
            self.device.as_ref(),
            &self.catalog,
            &self.retry,
            self.monitor.as_ref(),
        )
        .with_instrumented_user(self.instrumented_user);

        let scheduler = match StateApplier::new(&self.registry).apply(plan, &mut p) {
            Ok(s) => s,
            Err(e) => return TestRun::from_setup_error(e),
        };
        let guard = TeardownGuard::new(p, scheduler);

        let ctx = FixtureContext {
            state: guard.state(),
            device: self.device.as_ref(),
            catalog: &self.catalog,
        };
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            Ok(Ok(())) => TestOutcome::Passed,
            Ok(Err(e)) => {
                let skip = e
                    .downcast_ref::<crate::Error>()
                    .filter(|inner| inner.is_skip())
                    .map(|inner| inner.to_string());
                match skip {
                    Some(reason) => TestOutcome::Skipped(reason),
                    None => TestOutcome::Failed(e),
                }
            }
            Err(payload) => TestOutcome::Panicked(panic_message(payload)),
        };

        TestRun {
            outcome,
            teardown_failures: guard.finish(),
        }
    }
}
