use std::time::Duration;

use crate::applier::Provisioner;
use crate::config::RetryConfig;
use crate::device::Device;
use crate::events::NoopMonitor;
use crate::testapp::TestAppProvider;

/// Retries like the real thing but never sleeps
pub static FAST_RETRY: RetryConfig = RetryConfig {
    max_attempts: 3,
    initial_backoff: Duration::ZERO,
    max_backoff: Duration::ZERO,
    transient_markers: Vec::new(),
};

static NOOP: NoopMonitor = NoopMonitor;

pub fn provisioner<'a>(device: &'a dyn Device, catalog: &'a TestAppProvider) -> Provisioner<'a> {
    Provisioner::new(device, catalog, &FAST_RETRY, &NOOP)
}
