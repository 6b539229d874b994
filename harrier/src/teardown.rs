use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::applier::{FixtureState, Provisioner, Revert};
use crate::errors::UndoFailure;
use crate::events::FixtureEvent;
use crate::precondition::PreconditionRequest;
use crate::registry::UndoFn;

/// The record of one applied precondition and how to reverse it.
///
/// Undoing consumes the handle so nothing is ever reversed twice.
pub struct AppliedStateHandle {
    request: Arc<PreconditionRequest>,
    reverts: Vec<Revert>,
    undo: UndoFn,
}

impl AppliedStateHandle {
    pub fn new(request: Arc<PreconditionRequest>, reverts: Vec<Revert>, undo: UndoFn) -> Self {
        Self {
            request,
            reverts,
            undo,
        }
    }

    pub fn request(&self) -> &PreconditionRequest {
        &self.request
    }

    /// Changes recorded while applying, oldest first
    pub fn reverts(&self) -> &[Revert] {
        &self.reverts
    }

    /// Whether applying found the device already in the requested state
    pub fn is_empty(&self) -> bool {
        self.reverts.is_empty()
    }

    /// Reverse every recorded change, newest first. A failing change doesn't
    /// stop the rest from being attempted.
    pub fn undo(self, p: &mut Provisioner<'_>) -> Vec<UndoFailure> {
        let action = self.request.describe();
        p.begin(format!("undo {}", action));
        p.emit(FixtureEvent::Undoing {
            action: action.clone(),
        });

        let mut failures = Vec::new();
        for revert in self.reverts.iter().rev() {
            debug!("{}: {}", action, revert);
            if let Err(e) = (self.undo)(p, revert) {
                warn!("failed to {} while undoing {}: {}", revert, action, e);
                p.emit(FixtureEvent::UndoFailed {
                    action: revert.to_string(),
                    error: e.to_string(),
                });
                failures.push(UndoFailure {
                    kind: self.request.kind(),
                    target: self.request.effective_target(),
                    action: revert.to_string(),
                    error: e,
                });
            }
        }
        failures
    }
}

impl Display for AppliedStateHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} changes)", self.request, self.reverts.len())
    }
}

/// Holds applied handles in the order they were applied and undoes them in
/// reverse.
#[derive(Default)]
pub struct TeardownScheduler {
    handles: Vec<AppliedStateHandle>,
}

impl TeardownScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: AppliedStateHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[AppliedStateHandle] {
        &self.handles
    }

    /// Undo every handle, last applied first, collecting failures instead of
    /// stopping at them. The scheduler is empty afterwards.
    pub fn teardown(&mut self, p: &mut Provisioner<'_>) -> Vec<UndoFailure> {
        let mut failures = Vec::new();
        while let Some(handle) = self.handles.pop() {
            failures.extend(handle.undo(p));
        }
        failures
    }
}

impl Drop for TeardownScheduler {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            error!(
                "{} applied preconditions dropped without teardown",
                self.handles.len()
            );
        }
    }
}

/// Owns everything needed to tear a fixture down, and does so when dropped
/// if [TeardownGuard::finish] was never reached.
pub struct TeardownGuard<'a> {
    provisioner: Provisioner<'a>,
    scheduler: TeardownScheduler,
}

impl<'a> TeardownGuard<'a> {
    pub fn new(provisioner: Provisioner<'a>, scheduler: TeardownScheduler) -> Self {
        Self {
            provisioner,
            scheduler,
        }
    }

    pub fn state(&self) -> &FixtureState {
        self.provisioner.state()
    }

    pub fn provisioner(&self) -> &Provisioner<'a> {
        &self.provisioner
    }

    pub fn finish(mut self) -> Vec<UndoFailure> {
        self.scheduler.teardown(&mut self.provisioner)
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.scheduler.is_empty() {
            return;
        }
        warn!("fixture abandoned, tearing down");
        for f in self.scheduler.teardown(&mut self.provisioner) {
            error!("{}", f);
        }
    }
}
