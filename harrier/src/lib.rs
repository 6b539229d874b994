//! Declarative device state for Android instrumentation tests.
//!
//! Tests declare preconditions ("a work profile exists", "user restriction
//! `no_add_user` is set for the instrumented user"), the [resolver] turns them
//! into an ordered plan, the [applier] brings the device into that state and
//! [teardown] puts everything back afterwards. [fixture::DeviceState] ties
//! the pieces together around a test body.

pub mod adb;

pub mod applier;

pub mod command;
pub use command::run_cmd;

pub mod config;

pub mod context;
pub use context::{Context, DefaultContext};

pub mod device;

pub mod errors;
pub use errors::{Error, Result};

pub mod events;

pub mod fixture;
pub use fixture::{DeviceState, FixtureContext, TestOutcome, TestRun};

pub mod handlers;

pub mod plan;

pub mod precondition;
pub use precondition::{Precondition, PreconditionKind, PreconditionRequest, UserSelector};

pub mod registry;

pub mod resolver;

pub mod teardown;

pub mod testapp;

pub mod utils;

pub mod version;

#[cfg(test)]
pub mod testing;
