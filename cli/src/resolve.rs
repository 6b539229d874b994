use std::path::PathBuf;

use anyhow::bail;
use clap::{self, Args};

use harrier::plan::PlanRun;
use harrier::registry;
use harrier::resolver::{ResolvedPlan, Resolver};

use crate::utils::plan_runs;

#[derive(Args)]
pub struct Resolve {
    /// Only resolve this variant
    #[arg(short, long)]
    variant: Option<String>,

    /// The plan file
    #[arg()]
    plan: PathBuf,
}

fn resolve_run(run: &PlanRun) -> harrier::Result<ResolvedPlan> {
    Resolver::new(registry::global()).resolve(run.requests.clone())
}

impl Resolve {
    pub fn run(&self) -> anyhow::Result<()> {
        let runs = plan_runs(&self.plan, self.variant.as_deref())?;
        let mut failed = 0;

        for run in &runs {
            println!("{}:", run.name);
            match resolve_run(run) {
                Ok(plan) if plan.is_empty() => println!("  (nothing to apply)"),
                Ok(plan) => {
                    for action in &plan.actions {
                        println!("  {}", action);
                    }
                }
                Err(e) => {
                    failed += 1;
                    println!("  error: {}", e);
                }
            }
        }

        if failed > 0 {
            bail!("{} of {} runs failed to resolve", failed, runs.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use harrier::plan::TestPlan;
    use harrier::precondition::PreconditionKind;

    #[test]
    fn test_profile_created_before_its_restriction() {
        let plan = TestPlan::parse_str(
            r#"
[[method]]
kind = "user-restriction"
key = "no_add_user"
target-user = "work-profile"

[[method]]
kind = "work-profile"
"#,
        )
        .unwrap();
        let run = &plan.runs()[0];
        let resolved = resolve_run(run).unwrap();
        let kinds: Vec<_> = resolved.requests().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![PreconditionKind::WorkProfile, PreconditionKind::UserRestriction]
        );
    }

    #[test]
    fn test_contradiction_reported() {
        let plan = TestPlan::parse_str(
            r#"
[[method]]
kind = "user-restriction"
key = "no_add_user"

[[method]]
kind = "user-restriction"
key = "no_add_user"
requirement = "absent"
"#,
        )
        .unwrap();
        let run = &plan.runs()[0];
        assert!(matches!(
            resolve_run(run),
            Err(harrier::Error::ContradictoryPrecondition { .. })
        ));
    }
}
