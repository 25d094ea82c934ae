//! Overspeculation controller
//!
//! Decides which fork sites of a method are worth forking. For each site it
//! walks forward from the spawn through the control-flow graph:
//!
//! - reaching the consumer of the fork first → [`Verdict::NeededTooSoon`]
//! - reaching a return or synchronization first → [`Verdict::ForcedSyncTooSoon`]
//! - accumulating `min_work` units of unrelated work first → [`Verdict::Ok`]
//!
//! When paths disagree the more permissive verdict wins. Rejected sites are
//! rewritten into inline calls at their spawn position. An inline call
//! settles every fork still pending before it, so it is a synchronization
//! point for the remaining sites and a site accepted on one pass can be
//! rejected on the next. The scan repeats until no site is rejected. The loop is bounded
//! by `max_iterations` and by `max_growth`; hitting either bound reverts the
//! whole method to sequential execution.

use crate::{
    config::AnalysisConfig,
    error::AnalysisError,
    overspeculation::cfg::{BlockId, Insn, MethodBody, SiteId, Terminator},
};
use derive_more::Display;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    ops::ControlFlow,
};
use tracing::{debug, warn};

/// Classification of a fork site, ordered from least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize)]
pub enum Verdict {
    #[display("needed-too-soon")]
    NeededTooSoon,
    #[display("forced-sync-too-soon")]
    ForcedSyncTooSoon,
    #[display("ok")]
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RevertReason {
    /// Rejections kept appearing after `max_iterations` scans
    NonConvergence,
    /// Rewriting grew the method beyond `max_growth`
    ExcessiveGrowth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanStatus {
    Converged { iterations: u32 },
    Reverted(RevertReason),
}

/// Fork decisions for one method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForkPlan {
    pub method: String,
    /// Verdict of every site the method spawned originally
    pub verdicts: BTreeMap<SiteId, Verdict>,
    pub status: PlanStatus,
    /// The method with every rejected fork rewritten inline
    pub body: MethodBody,
}

impl ForkPlan {
    pub fn is_sequential(&self) -> bool {
        matches!(self.status, PlanStatus::Reverted(_))
    }

    /// Whether `site` may be forked at all (admission still applies).
    pub fn allows(&self, site: SiteId) -> bool {
        !self.is_sequential() && self.verdicts.get(&site) == Some(&Verdict::Ok)
    }

    pub fn accepted(&self) -> Vec<SiteId> {
        self.verdicts
            .keys()
            .copied()
            .filter(|site| self.allows(*site))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverspeculationController {
    config: AnalysisConfig,
}

impl OverspeculationController {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze `body` and produce its fork plan.
    pub fn analyze(&self, body: &MethodBody) -> Result<ForkPlan, AnalysisError> {
        body.validate()?;
        let original_size = body.size(self.config.rewrite_size);
        let size_limit = original_size as f64 * self.config.max_growth;
        let mut current = body.clone();
        let mut verdicts = BTreeMap::new();

        for iteration in 1..=self.config.max_iterations {
            let mut rejected = Vec::new();
            for (site, block, index) in current.spawn_sites() {
                let verdict = self.classify_at(&current, site, block, index);
                verdicts.insert(site, verdict);
                if verdict != Verdict::Ok {
                    rejected.push(site);
                }
            }

            if rejected.is_empty() {
                debug!(
                    target: "speculation",
                    method = %body.name,
                    iterations = iteration,
                    accepted = verdicts.values().filter(|v| **v == Verdict::Ok).count(),
                    "Fork plan converged"
                );
                return Ok(ForkPlan {
                    method: body.name.clone(),
                    verdicts,
                    status: PlanStatus::Converged {
                        iterations: iteration,
                    },
                    body: current,
                });
            }

            for site in rejected {
                debug!(
                    target: "speculation",
                    method = %body.name,
                    site = %site,
                    verdict = %verdicts[&site],
                    "Rejecting fork site"
                );
                current.inline_site(site, self.config.rewrite_size);
            }

            if current.size(self.config.rewrite_size) as f64 > size_limit {
                return Ok(self.revert(body, verdicts, RevertReason::ExcessiveGrowth));
            }
        }

        Ok(self.revert(body, verdicts, RevertReason::NonConvergence))
    }

    /// Classify `site` in `body` as it stands, without rewriting anything.
    pub fn classify(&self, body: &MethodBody, site: SiteId) -> Option<Verdict> {
        let (_, block, index) = body.spawn_sites().into_iter().find(|(s, _, _)| *s == site)?;
        Some(self.classify_at(body, site, block, index))
    }

    fn classify_at(&self, body: &MethodBody, site: SiteId, block: BlockId, index: usize) -> Verdict {
        let mut walk = Walk {
            body,
            site,
            min_work: self.config.min_work,
            memo: HashMap::new(),
        };
        walk.from(block, index + 1, 0)
    }

    fn revert(&self, body: &MethodBody, verdicts: BTreeMap<SiteId, Verdict>, reason: RevertReason) -> ForkPlan {
        warn!(
            target: "speculation",
            method = %body.name,
            reason = ?reason,
            "Reverting method to sequential execution"
        );
        let mut sequential = body.clone();
        for (site, _, _) in body.spawn_sites() {
            sequential.inline_site(site, self.config.rewrite_size);
        }
        ForkPlan {
            method: body.name.clone(),
            verdicts,
            status: PlanStatus::Reverted(reason),
            body: sequential,
        }
    }
}

/// Forward scan from one spawn. Work below `min_work` is the only state a
/// path carries, so verdicts are memoized per block and work so far.
struct Walk<'a> {
    body: &'a MethodBody,
    site: SiteId,
    min_work: u32,
    /// `None` while the state is still being walked
    memo: HashMap<(BlockId, u32), Option<Verdict>>,
}

impl Walk<'_> {
    fn from(&mut self, block: BlockId, start: usize, work: u32) -> Verdict {
        let Some(current) = self.body.block(block) else {
            return Verdict::ForcedSyncTooSoon;
        };
        let work = match self.scan(current.insns.get(start..).unwrap_or_default(), work) {
            ControlFlow::Break(verdict) => return verdict,
            ControlFlow::Continue(work) => work,
        };

        match current.terminator {
            Terminator::Return => Verdict::ForcedSyncTooSoon,
            Terminator::Goto(target) => self.enter(target, work),
            Terminator::Branch(taken, fallthrough) => {
                let taken = self.enter(taken, work);
                if taken == Verdict::Ok {
                    return taken;
                }
                taken.max(self.enter(fallthrough, work))
            }
        }
    }

    fn scan(&self, insns: &[Insn], mut work: u32) -> ControlFlow<Verdict, u32> {
        for insn in insns {
            match insn {
                Insn::Get(consumed) if *consumed == self.site => return ControlFlow::Break(Verdict::NeededTooSoon),
                // An inline call settles the fork before running
                Insn::Sync | Insn::Invoke { .. } => return ControlFlow::Break(Verdict::ForcedSyncTooSoon),
                other => {
                    work = work.saturating_add(other.work());
                    if work >= self.min_work {
                        return ControlFlow::Break(Verdict::Ok);
                    }
                }
            }
        }
        ControlFlow::Continue(work)
    }

    fn enter(&mut self, block: BlockId, work: u32) -> Verdict {
        match self.memo.get(&(block, work)) {
            Some(Some(verdict)) => return *verdict,
            // Looping back without new work repeats what was already walked
            Some(None) => return Verdict::Ok,
            None => {}
        }
        self.memo.insert((block, work), None);
        let verdict = self.from(block, 0, work);
        self.memo.insert((block, work), Some(verdict));
        verdict
    }
}

/// Fork-site decisions consulted at admission. Sites without an installed
/// plan are allowed.
#[derive(Debug, Default)]
pub struct PlanTable {
    sites: RwLock<HashMap<SiteId, bool>>,
}

impl PlanTable {
    pub fn install(&self, plan: &ForkPlan) {
        let mut sites = self.sites.write();
        for site in plan.verdicts.keys() {
            sites.insert(*site, plan.allows(*site));
        }
    }

    pub fn allows(&self, site: SiteId) -> bool {
        self.sites.read().get(&site).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const S1: SiteId = SiteId(1);
    const S2: SiteId = SiteId(2);

    fn controller() -> OverspeculationController {
        OverspeculationController::new(AnalysisConfig::default().with_min_work(10))
    }

    #[test]
    fn test_immediate_get_is_needed_too_soon() {
        let body = MethodBody::new("m").with_block(
            vec![Insn::Spawn(S1), Insn::Work(2), Insn::Get(S1), Insn::Work(50)],
            Terminator::Return,
        );
        assert_eq!(controller().classify(&body, S1), Some(Verdict::NeededTooSoon));
    }

    #[test]
    fn test_return_is_forced_sync_too_soon() {
        let body = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(S1), Insn::Work(3)], Terminator::Goto(1))
            .with_block(vec![Insn::Sync, Insn::Get(S1)], Terminator::Return);
        assert_eq!(controller().classify(&body, S1), Some(Verdict::ForcedSyncTooSoon));

        let body = MethodBody::new("m").with_block(vec![Insn::Spawn(S1)], Terminator::Return);
        assert_eq!(controller().classify(&body, S1), Some(Verdict::ForcedSyncTooSoon));
    }

    #[test]
    fn test_enough_work_is_ok() {
        let body = MethodBody::new("m").with_block(
            vec![Insn::Spawn(S1), Insn::Work(6), Insn::Work(4), Insn::Get(S1)],
            Terminator::Return,
        );
        assert_eq!(controller().classify(&body, S1), Some(Verdict::Ok));
    }

    #[test]
    fn test_branches_take_more_permissive_verdict() {
        // 0: spawn; branch to 1 (needs result now) or 2 (plenty of work)
        let body = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(S1)], Terminator::Branch(1, 2))
            .with_block(vec![Insn::Get(S1)], Terminator::Return)
            .with_block(vec![Insn::Work(20), Insn::Get(S1)], Terminator::Return);
        assert_eq!(controller().classify(&body, S1), Some(Verdict::Ok));

        let body = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(S1)], Terminator::Branch(1, 2))
            .with_block(vec![Insn::Get(S1)], Terminator::Return)
            .with_block(vec![Insn::Work(1)], Terminator::Return);
        assert_eq!(controller().classify(&body, S1), Some(Verdict::ForcedSyncTooSoon));
    }

    #[test]
    fn test_back_edge_counts_as_ok() {
        // 0: spawn -> 1: loop header, work 1, branch back to 1 or exit to 2
        let body = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(S1)], Terminator::Goto(1))
            .with_block(vec![Insn::Work(1)], Terminator::Branch(1, 2))
            .with_block(vec![Insn::Get(S1)], Terminator::Return);
        assert_eq!(controller().classify(&body, S1), Some(Verdict::Ok));
    }

    #[test]
    fn test_plan_rewrites_rejected_sites() {
        let body = MethodBody::new("m").with_block(
            vec![
                Insn::Spawn(S1),
                Insn::Get(S1),
                Insn::Spawn(S2),
                Insn::Work(30),
                Insn::Get(S2),
            ],
            Terminator::Return,
        );
        let plan = controller().analyze(&body).unwrap();

        assert_eq!(plan.status, PlanStatus::Converged { iterations: 2 });
        assert_eq!(plan.verdicts[&S1], Verdict::NeededTooSoon);
        assert_eq!(plan.verdicts[&S2], Verdict::Ok);
        assert!(!plan.allows(S1));
        assert!(plan.allows(S2));
        assert_eq!(plan.accepted(), vec![S2]);
        // The rejected fork never survives into the rewritten body
        assert!(!plan.body.spawns(S1));
        assert!(plan.body.spawns(S2));
    }

    /// S2 is spawned first and sees plenty of work, until S1 is rejected and
    /// its inline call lands inside S2's window.
    fn cascading_body() -> MethodBody {
        MethodBody::new("m").with_block(
            vec![
                Insn::Spawn(S2),
                Insn::Work(3),
                Insn::Spawn(S1),
                Insn::Get(S1),
                Insn::Work(30),
                Insn::Get(S2),
            ],
            Terminator::Return,
        )
    }

    #[test]
    fn test_inline_call_exposes_new_rejection() {
        let body = cascading_body();
        assert_eq!(controller().classify(&body, S2), Some(Verdict::Ok));

        let plan = controller().analyze(&body).unwrap();
        assert_eq!(plan.status, PlanStatus::Converged { iterations: 3 });
        assert_eq!(plan.verdicts[&S1], Verdict::NeededTooSoon);
        assert_eq!(plan.verdicts[&S2], Verdict::ForcedSyncTooSoon);
        assert!(plan.accepted().is_empty());
        assert!(plan.body.spawn_sites().is_empty());
    }

    #[test]
    fn test_inline_call_on_other_branch_keeps_site() {
        // 0: spawn S2; branch to 1 (S1 needed at once) or 2; both merge at 3
        let body = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(S2)], Terminator::Branch(1, 2))
            .with_block(vec![Insn::Spawn(S1), Insn::Get(S1)], Terminator::Goto(3))
            .with_block(vec![Insn::Work(2)], Terminator::Goto(3))
            .with_block(vec![Insn::Work(30), Insn::Get(S2)], Terminator::Return);
        let plan = controller().analyze(&body).unwrap();

        assert_eq!(plan.status, PlanStatus::Converged { iterations: 2 });
        assert!(!plan.allows(S1));
        assert!(plan.allows(S2));
    }

    #[test]
    fn test_long_diamond_chain_is_linear() {
        // 30 empty branch/merge diamonds between the spawn and its consumer
        let diamonds = 30;
        let mut body = MethodBody::new("diamonds");
        for diamond in 0..diamonds {
            let head = diamond * 3;
            let insns = if diamond == 0 { vec![Insn::Spawn(S1)] } else { Vec::new() };
            body.push_block(insns, Terminator::Branch(head + 1, head + 2));
            body.push_block(Vec::new(), Terminator::Goto(head + 3));
            body.push_block(vec![Insn::Work(1)], Terminator::Goto(head + 3));
        }
        body.push_block(vec![Insn::Get(S1)], Terminator::Return);

        let started = Instant::now();
        assert_eq!(controller().classify(&body, S1), Some(Verdict::Ok));
        let mut idle = body.clone();
        for block in &mut idle.blocks {
            block.insns.retain(|insn| *insn != Insn::Work(1));
        }
        assert_eq!(controller().classify(&idle, S1), Some(Verdict::NeededTooSoon));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_non_convergence_reverts_method() {
        let body = cascading_body();
        let controller = OverspeculationController::new(AnalysisConfig::default().with_max_iterations(2));
        let plan = controller.analyze(&body).unwrap();

        assert_eq!(plan.status, PlanStatus::Reverted(RevertReason::NonConvergence));
        assert!(plan.is_sequential());
        assert!(!plan.allows(S2));
        assert!(plan.body.spawn_sites().is_empty());
    }

    #[test]
    fn test_excessive_growth_reverts_method() {
        let body = MethodBody::new("m").with_block(
            vec![Insn::Spawn(S1), Insn::Get(S1), Insn::Get(S1)],
            Terminator::Return,
        );
        let controller = OverspeculationController::new(
            AnalysisConfig::default().with_rewrite_size(10).with_max_growth(1.5),
        );
        let plan = controller.analyze(&body).unwrap();
        assert_eq!(plan.status, PlanStatus::Reverted(RevertReason::ExcessiveGrowth));
    }

    #[test]
    fn test_plan_table() {
        let body = MethodBody::new("m").with_block(
            vec![Insn::Spawn(S1), Insn::Get(S1), Insn::Spawn(S2), Insn::Work(30), Insn::Get(S2)],
            Terminator::Return,
        );
        let plan = controller().analyze(&body).unwrap();
        let table = PlanTable::default();
        assert!(table.allows(S1));

        table.install(&plan);
        assert!(!table.allows(S1));
        assert!(table.allows(S2));
        assert!(table.allows(SiteId(99)));
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let body = MethodBody::new("m").with_block(vec![], Terminator::Goto(7));
        assert!(matches!(
            controller().analyze(&body),
            Err(AnalysisError::MissingBlock { .. })
        ));
    }
}
