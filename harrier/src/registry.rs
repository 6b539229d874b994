//! The table from precondition kind to the functions that apply and undo it.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::applier::{Provisioner, Revert};
use crate::handlers;
use crate::precondition::{PreconditionKind, PreconditionRequest, Requirement};

/// Brings the device into the requested state, recording a [Revert] on the
/// provisioner for every change it makes.
pub type ApplyFn =
    Arc<dyn Fn(&mut Provisioner<'_>, &PreconditionRequest) -> crate::Result<()> + Send + Sync>;

/// Reverses one change recorded by an [ApplyFn]
pub type UndoFn = Arc<dyn Fn(&mut Provisioner<'_>, &Revert) -> crate::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Handler {
    pub apply: ApplyFn,
    pub undo: UndoFn,
    /// Requirements the handler knows how to bring about
    pub supports: &'static [Requirement],
}

impl Handler {
    pub fn new(apply: ApplyFn, undo: UndoFn) -> Self {
        Self {
            apply,
            undo,
            supports: &[Requirement::Present, Requirement::Absent],
        }
    }

    pub fn supporting(mut self, supports: &'static [Requirement]) -> Self {
        self.supports = supports;
        self
    }

    pub fn supports(&self, requirement: Requirement) -> bool {
        self.supports.contains(&requirement)
    }
}

/// Built once before any test runs and only read afterwards.
#[derive(Clone, Default)]
pub struct AnnotationRegistry {
    handlers: BTreeMap<PreconditionKind, Handler>,
}

impl AnnotationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a handler for every built in kind
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for (kind, handler) in handlers::defaults() {
            // Every built in kind appears exactly once
            if let Err(e) = reg.register_handler(kind, handler) {
                log::error!("{}", e);
            }
        }
        reg
    }

    pub fn register(
        &mut self,
        kind: PreconditionKind,
        apply: ApplyFn,
        undo: UndoFn,
    ) -> crate::Result<()> {
        self.register_handler(kind, Handler::new(apply, undo))
    }

    pub fn register_handler(&mut self, kind: PreconditionKind, handler: Handler) -> crate::Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(crate::Error::DuplicateKind(kind));
        }
        log::trace!("registered handler for {}", kind);
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn lookup(&self, kind: PreconditionKind) -> crate::Result<&Handler> {
        self.handlers
            .get(&kind)
            .ok_or(crate::Error::UnknownPrecondition(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = PreconditionKind> + '_ {
        self.handlers.keys().copied()
    }
}

static GLOBAL: Lazy<AnnotationRegistry> = Lazy::new(AnnotationRegistry::with_defaults);

/// The process wide registry of built in handlers
pub fn global() -> &'static AnnotationRegistry {
    &GLOBAL
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_apply() -> ApplyFn {
        Arc::new(|_: &mut Provisioner<'_>, _: &PreconditionRequest| Ok(()))
    }

    fn noop_undo() -> UndoFn {
        Arc::new(|_: &mut Provisioner<'_>, _: &Revert| Ok(()))
    }

    #[test]
    fn test_duplicate_kind() {
        let mut reg = AnnotationRegistry::new();
        reg.register(PreconditionKind::WorkProfile, noop_apply(), noop_undo())
            .unwrap();
        assert!(matches!(
            reg.register(PreconditionKind::WorkProfile, noop_apply(), noop_undo()),
            Err(crate::Error::DuplicateKind(PreconditionKind::WorkProfile))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let reg = AnnotationRegistry::new();
        assert!(matches!(
            reg.lookup(PreconditionKind::Delegate),
            Err(crate::Error::UnknownPrecondition(PreconditionKind::Delegate))
        ));
    }

    #[test]
    fn test_defaults_cover_every_kind() {
        let reg = global();
        for kind in PreconditionKind::ALL {
            assert!(reg.lookup(kind).is_ok(), "{} not registered", kind);
        }
        assert!(!reg
            .lookup(PreconditionKind::Delegate)
            .unwrap()
            .supports(Requirement::Absent));
        assert!(reg
            .lookup(PreconditionKind::WorkProfile)
            .unwrap()
            .supports(Requirement::Absent));
    }
}
