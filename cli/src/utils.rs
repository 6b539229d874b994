use std::fmt::Display;
use std::path::Path;
use std::thread::JoinHandle;

use anyhow::{bail, Context as AnyhowContext};
use itertools::Itertools;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::{Handle, Signals};

use harrier::command::quote;
use harrier::events::{TaskCancelCheck, TaskCanceller};
use harrier::plan::{PlanRun, TestPlan};

/// Quote every argument for `sh` and join them
pub fn quoted_args<I, E>(args: I) -> String
where
    E: Display,
    I: IntoIterator<Item = E>,
{
    args.into_iter()
        .map(|e| quote(&e.to_string()))
        .join(" ")
}

/// Parse the plan at `path` and pick the runs to do, all of them unless
/// `variant` names one
pub fn plan_runs(path: &Path, variant: Option<&str>) -> anyhow::Result<Vec<PlanRun>> {
    let plan =
        TestPlan::parse(path).with_context(|| format!("loading plan {}", path.display()))?;
    match variant {
        None => Ok(plan.runs()),
        Some(name) => match plan.run(name) {
            Some(run) => Ok(vec![run]),
            None => bail!(
                "no variant {} in {}, have: {}",
                name,
                path.display(),
                plan.runs().iter().map(|r| r.name.as_str()).join(", ")
            ),
        },
    }
}

pub struct HookedSignals {
    sig_handle: Handle,
    _join_handle: JoinHandle<()>,
}

impl Drop for HookedSignals {
    fn drop(&mut self) {
        if !self.sig_handle.is_closed() {
            self.sig_handle.close();
        }
    }
}

/// Cancel on the first termination signal, a second one gets the default
/// behavior
pub fn hook_to_signals(mut cancel: TaskCanceller) -> anyhow::Result<HookedSignals> {
    let mut sigs = Signals::new(TERM_SIGNALS)?;
    let sig_handle = sigs.handle();
    let _join_handle = std::thread::spawn(move || {
        let mut seen_exit = false;
        for sig in sigs.forever() {
            if seen_exit {
                _ = signal_hook::low_level::emulate_default_handler(sig);
            } else {
                log::warn!("received signal {}, cancelling", sig);
                cancel.cancel();
                seen_exit = true;
            }
        }
    });

    Ok(HookedSignals {
        sig_handle,
        _join_handle,
    })
}

pub fn task_canceller() -> anyhow::Result<(HookedSignals, TaskCancelCheck)> {
    let (cancel, check) = TaskCanceller::new();
    Ok((hook_to_signals(cancel)?, check))
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(&["ls", "-l"], "'ls' '-l'")]
    #[case(&["echo", "it's"], "'echo' 'it'\"'\"'s'")]
    fn test_quoted_args(#[case] args: &[&str], #[case] expected: &str) {
        assert_eq!(quoted_args(args), expected);
    }
}
