//! Turns the unordered set of declared preconditions into a single linear
//! plan, rejecting contradictory or unsatisfiable sets before anything
//! touches the device.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use log::{debug, trace};

use crate::precondition::{
    Identity, Level, Precondition, PreconditionKind, PreconditionRequest, Requirement,
    UserSelector,
};
use crate::registry::AnnotationRegistry;

/// One step of a resolved plan
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub request: Arc<PreconditionRequest>,
    /// Index in [ResolvedPlan::actions]
    pub position: usize,
    /// Positions of the actions that must run first
    pub depends_on: Vec<usize>,
}

impl Display for ResolvedAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.position + 1, self.request)?;
        if !self.depends_on.is_empty() {
            let deps: Vec<String> = self.depends_on.iter().map(|d| (d + 1).to_string()).collect();
            write!(f, " (after {})", deps.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    pub actions: Vec<ResolvedAction>,
}

impl ResolvedPlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn requests(&self) -> impl Iterator<Item = &PreconditionRequest> {
        self.actions.iter().map(|a| a.request.as_ref())
    }
}

impl Display for ResolvedPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for a in &self.actions {
            writeln!(f, "{}", a)?;
        }
        Ok(())
    }
}

pub struct Resolver<'r> {
    registry: &'r AnnotationRegistry,
}

impl<'r> Resolver<'r> {
    pub fn new(registry: &'r AnnotationRegistry) -> Self {
        Self { registry }
    }

    /// Resolve `requests`, given in declaration order, into a plan.
    ///
    /// The same input always yields the same plan.
    pub fn resolve(&self, requests: Vec<PreconditionRequest>) -> crate::Result<ResolvedPlan> {
        for req in &requests {
            self.validate(req)?;
        }

        let (requests, aliases) = collapse(requests);
        check_contradictions(&requests)?;

        let edges = build_edges(&requests, &aliases)?;
        let order = linearize(&requests, &edges)?;

        let mut position = vec![0usize; requests.len()];
        for (pos, idx) in order.iter().enumerate() {
            position[*idx] = pos;
        }

        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); requests.len()];
        for (from, tos) in edges.iter().enumerate() {
            for to in tos {
                preds[*to].insert(position[from]);
            }
        }

        let mut slots: Vec<Option<PreconditionRequest>> = requests.into_iter().map(Some).collect();
        let mut actions = Vec::with_capacity(order.len());
        for (pos, idx) in order.into_iter().enumerate() {
            let Some(request) = slots[idx].take() else {
                return Err(crate::Error::new_generic("request ordered twice"));
            };
            trace!("resolved {} at {}", request, pos);
            actions.push(ResolvedAction {
                request: Arc::new(request),
                position: pos,
                depends_on: preds[idx].iter().copied().collect(),
            });
        }

        debug!("resolved {} preconditions", actions.len());
        Ok(ResolvedPlan { actions })
    }

    fn validate(&self, req: &PreconditionRequest) -> crate::Result<()> {
        let handler = self.registry.lookup(req.kind())?;
        if !handler.supports(req.requirement) {
            return Err(crate::Error::UnsupportedRequirement(
                req.kind(),
                req.requirement,
            ));
        }
        let setting = match &req.precondition {
            Precondition::GlobalSetting { key, value: None } => Some(("global", key)),
            Precondition::SecureSetting { key, value: None } => Some(("secure", key)),
            _ => None,
        };
        if let (Some((table, key)), Requirement::Present) = (setting, req.requirement) {
            return Err(crate::Error::new_plan(&format!(
                "{} setting `{}` required present without a value",
                table, key
            )));
        }
        Ok(())
    }
}

/// Apply method level overrides and drop exact duplicates. Returns the
/// surviving requests in declaration order and a map from the ids of dropped
/// requests to the index of the request that replaced them.
fn collapse(requests: Vec<PreconditionRequest>) -> (Vec<PreconditionRequest>, BTreeMap<String, usize>) {
    let overridden: BTreeSet<usize> = requests
        .iter()
        .enumerate()
        .filter(|(_, r)| r.origin.level == Level::Class)
        .filter(|(_, r)| {
            requests.iter().any(|m| {
                m.origin.level == Level::Method
                    && m.requirement == r.requirement
                    && m.identity() == r.identity()
            })
        })
        .map(|(i, _)| i)
        .collect();

    let mut kept: Vec<PreconditionRequest> = Vec::with_capacity(requests.len());
    // (dropped id, index into `requests` of the request replacing it)
    let mut dropped_ids: Vec<(String, usize)> = Vec::new();
    let mut original_index: Vec<usize> = Vec::with_capacity(requests.len());

    for (i, req) in requests.iter().enumerate() {
        if overridden.contains(&i) {
            if let Some(id) = &req.id {
                // The first method level request with the same identity
                // takes over the id
                if let Some(j) = requests.iter().position(|m| {
                    m.origin.level == Level::Method
                        && m.requirement == req.requirement
                        && m.identity() == req.identity()
                }) {
                    dropped_ids.push((id.clone(), j));
                }
            }
            debug!("{} overridden at method level", req);
            continue;
        }

        if let Some(first) = kept.iter().position(|k| k.same_demand(req)) {
            if let Some(id) = &req.id {
                dropped_ids.push((id.clone(), original_index[first]));
            }
            trace!("dropping duplicate {}", req);
            continue;
        }

        original_index.push(i);
        kept.push(req.clone());
    }

    let mut aliases = BTreeMap::new();
    for (id, orig) in dropped_ids {
        // A replacement may itself have been dropped as a duplicate
        let target = original_index
            .iter()
            .position(|o| *o == orig)
            .or_else(|| {
                let replaced = &requests[orig];
                kept.iter().position(|k| k.same_demand(replaced))
            });
        if let Some(t) = target {
            aliases.insert(id, t);
        }
    }

    (kept, aliases)
}

fn contradiction(req: &PreconditionRequest, reason: String) -> crate::Error {
    crate::Error::ContradictoryPrecondition {
        kind: req.kind(),
        target: req.effective_target(),
        reason,
    }
}

fn check_contradictions(requests: &[PreconditionRequest]) -> crate::Result<()> {
    let mut by_identity: BTreeMap<Identity, Vec<&PreconditionRequest>> = BTreeMap::new();
    for req in requests {
        by_identity.entry(req.identity()).or_default().push(req);
    }

    for (identity, reqs) in &by_identity {
        let present: Vec<_> = reqs
            .iter()
            .filter(|r| r.requirement == Requirement::Present)
            .collect();
        let absent = reqs.iter().any(|r| r.requirement == Requirement::Absent);
        if let (Some(first), true) = (present.first(), absent) {
            return Err(contradiction(
                first,
                format!("{} is required both present and absent", identity),
            ));
        }
        if let Some(first) = present.first() {
            if present
                .iter()
                .skip(1)
                .any(|r| r.precondition != first.precondition)
            {
                let reason = match &first.precondition {
                    Precondition::GlobalSetting { key, .. } => {
                        format!("global setting `{}` is required with different values", key)
                    }
                    Precondition::SecureSetting { key, .. } => {
                        format!("secure setting `{}` is required with different values", key)
                    }
                    _ => format!("{} is required with different parameters", identity),
                };
                return Err(contradiction(first, reason));
            }
        }
    }

    let primaries: Vec<_> = requests.iter().filter(|r| r.is_primary).collect();
    if primaries.len() > 1 {
        return Err(contradiction(
            primaries[1],
            format!(
                "only one precondition can be primary, found {}",
                primaries
                    .iter()
                    .map(|r| r.describe())
                    .collect::<Vec<_>>()
                    .join(" and ")
            ),
        ));
    }

    for removed in requests
        .iter()
        .filter(|r| r.requirement == Requirement::Absent)
    {
        let Some(selector) = removed.kind().creates_user() else {
            continue;
        };
        if let Some(user) = requests.iter().find(|r| r.effective_target() == selector) {
            return Err(contradiction(
                user,
                format!("targets the {} user but {} is also required", selector, removed),
            ));
        }
    }

    Ok(())
}

/// `edges[a]` holds every request that must run after `a`
fn build_edges(
    requests: &[PreconditionRequest],
    aliases: &BTreeMap<String, usize>,
) -> crate::Result<Vec<BTreeSet<usize>>> {
    let mut ids: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, req) in requests.iter().enumerate() {
        if let Some(id) = &req.id {
            if ids.insert(id.as_str(), i).is_some() {
                return Err(crate::Error::new_plan(&format!("duplicate id `{}`", id)));
            }
        }
    }

    let mut edges = vec![BTreeSet::new(); requests.len()];
    let mut add = |from: usize, to: usize| {
        if from != to {
            edges[from].insert(to);
        }
    };

    for (b, req) in requests.iter().enumerate() {
        let target = req.effective_target();
        if matches!(target, UserSelector::WorkProfile | UserSelector::Additional) {
            for (a, creator) in requests.iter().enumerate() {
                if creator.requirement == Requirement::Present
                    && creator.kind().creates_user() == Some(target)
                {
                    add(a, b);
                }
            }
        }

        if let Precondition::Delegate { test_app, .. } = &req.precondition {
            for (a, other) in requests.iter().enumerate() {
                if other.requirement != Requirement::Present {
                    continue;
                }
                match other.kind() {
                    PreconditionKind::TestAppInstalled
                        if other.identity().param.as_deref() == Some(test_app.as_str()) =>
                    {
                        add(a, b)
                    }
                    PreconditionKind::DeviceOwner | PreconditionKind::ProfileOwner => add(a, b),
                    _ => {}
                }
            }
        }

        for dep in &req.after {
            let a = ids
                .get(dep.as_str())
                .copied()
                .or_else(|| aliases.get(dep).copied())
                .ok_or_else(|| crate::Error::UnknownDependency(dep.clone()))?;
            add(a, b);
        }
    }

    Ok(edges)
}

/// Topological order, ties broken by priority then declaration
fn linearize(requests: &[PreconditionRequest], edges: &[BTreeSet<usize>]) -> crate::Result<Vec<usize>> {
    let mut indegree = vec![0usize; requests.len()];
    for tos in edges {
        for to in tos {
            indegree[*to] += 1;
        }
    }

    let key = |i: usize| {
        let r = &requests[i];
        Reverse((r.priority, r.origin.level, i))
    };

    let mut ready: BinaryHeap<_> = (0..requests.len())
        .filter(|i| indegree[*i] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(requests.len());
    while let Some(Reverse((_, _, i))) = ready.pop() {
        order.push(i);
        for to in &edges[i] {
            indegree[*to] -= 1;
            if indegree[*to] == 0 {
                ready.push(key(*to));
            }
        }
    }

    if order.len() < requests.len() {
        return Err(crate::Error::CyclicPrecondition(find_cycle(
            requests, edges, &indegree,
        )));
    }
    Ok(order)
}

/// Name the requests on one cycle among the nodes Kahn's algorithm couldn't
/// place, first request repeated at the end.
fn find_cycle(
    requests: &[PreconditionRequest],
    edges: &[BTreeSet<usize>],
    indegree: &[usize],
) -> Vec<String> {
    let stuck: BTreeSet<usize> = (0..requests.len()).filter(|i| indegree[*i] > 0).collect();

    // Every stuck node has a stuck predecessor, walking backwards must
    // eventually revisit a node.
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen = BTreeMap::from([(start, 0usize)]);
    let mut cur = start;
    let cycle_start = loop {
        let Some(pred) = stuck.iter().copied().find(|p| edges[*p].contains(&cur)) else {
            break 0;
        };
        if let Some(&at) = seen.get(&pred) {
            break at;
        }
        seen.insert(pred, path.len());
        path.push(pred);
        cur = pred;
    };

    let mut cycle: Vec<usize> = path[cycle_start..].to_vec();
    cycle.reverse();
    if let Some(&first) = cycle.first() {
        cycle.push(first);
    }
    cycle.into_iter().map(|i| requests[i].describe()).collect()
}
