//! Control-flow graph of a method body, as seen by the overspeculation
//! controller.
//!
//! Only what matters for fork placement is modeled: where forks are spawned
//! and consumed, how much unrelated work lies in between, and where the
//! method synchronizes or returns.

use crate::error::AnalysisError;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier of a fork site, unique across the program.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[display("site#{_0}")]
pub struct SiteId(pub u32);

pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Insn {
    /// Fork the computation of `site`
    Spawn(SiteId),
    /// Consume the result of `site`
    Get(SiteId),
    /// Unrelated work, in abstract cost units
    Work(u32),
    /// Inline call that replaced a rejected fork of `site`. It runs on the
    /// spawner's context, so its first heap read settles every fork still
    /// pending there.
    Invoke { site: SiteId, cost: u32 },
    /// The enclosing computation must finish or synchronize here
    Sync,
}

impl Insn {
    /// Work units this instruction performs.
    pub fn work(&self) -> u32 {
        match self {
            Insn::Work(cost) | Insn::Invoke { cost, .. } => *cost,
            Insn::Spawn(_) | Insn::Get(_) | Insn::Sync => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    Goto(BlockId),
    Branch(BlockId, BlockId),
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub insns: Vec<Insn>,
    pub terminator: Terminator,
}

impl Block {
    pub fn new(insns: Vec<Insn>, terminator: Terminator) -> Self {
        Self { insns, terminator }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.terminator {
            Terminator::Goto(target) => vec![target],
            Terminator::Branch(taken, fallthrough) => vec![taken, fallthrough],
            Terminator::Return => Vec::new(),
        }
    }
}

/// A method body. Block 0 is the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBody {
    pub name: String,
    pub blocks: Vec<Block>,
}

impl MethodBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
        }
    }

    /// Append a block and return its id.
    pub fn push_block(&mut self, insns: Vec<Insn>, terminator: Terminator) -> BlockId {
        self.blocks.push(Block::new(insns, terminator));
        self.blocks.len() - 1
    }

    pub fn with_block(mut self, insns: Vec<Insn>, terminator: Terminator) -> Self {
        self.push_block(insns, terminator);
        self
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.blocks.is_empty() {
            return Err(AnalysisError::EmptyMethod);
        }
        let mut spawned = HashSet::new();
        for (block, body) in self.blocks.iter().enumerate() {
            if let Some(target) = body.successors().into_iter().find(|t| *t >= self.blocks.len()) {
                return Err(AnalysisError::MissingBlock { block, target });
            }
            for insn in &body.insns {
                if let Insn::Spawn(site) = insn {
                    if !spawned.insert(*site) {
                        return Err(AnalysisError::DuplicateSpawn(site.0));
                    }
                }
            }
        }
        Ok(())
    }

    /// Every `Spawn` with its position, in block order.
    pub fn spawn_sites(&self) -> Vec<(SiteId, BlockId, usize)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(block, body)| {
                body.insns.iter().enumerate().filter_map(move |(index, insn)| match insn {
                    Insn::Spawn(site) => Some((*site, block, index)),
                    _ => None,
                })
            })
            .collect()
    }

    pub fn spawns(&self, site: SiteId) -> bool {
        self.blocks
            .iter()
            .any(|block| block.insns.contains(&Insn::Spawn(site)))
    }

    /// Code size, counting each inline call sequence as `rewrite_size`.
    pub fn size(&self, rewrite_size: u32) -> u64 {
        self.blocks
            .iter()
            .flat_map(|block| &block.insns)
            .map(|insn| match insn {
                Insn::Invoke { .. } => u64::from(rewrite_size),
                _ => 1,
            })
            .sum()
    }

    /// Replace the fork of `site` by sequential code: the spawn becomes an
    /// inline call costing `cost` and every consumption disappears.
    pub fn inline_site(&mut self, site: SiteId, cost: u32) {
        for block in &mut self.blocks {
            block.insns.retain(|insn| *insn != Insn::Get(site));
            for insn in &mut block.insns {
                if *insn == Insn::Spawn(site) {
                    *insn = Insn::Invoke { site, cost };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_catches_malformed_bodies() {
        assert_eq!(MethodBody::new("m").validate(), Err(AnalysisError::EmptyMethod));

        let dangling = MethodBody::new("m").with_block(vec![], Terminator::Goto(3));
        assert_eq!(
            dangling.validate(),
            Err(AnalysisError::MissingBlock { block: 0, target: 3 })
        );

        let twice = MethodBody::new("m")
            .with_block(vec![Insn::Spawn(SiteId(1))], Terminator::Goto(1))
            .with_block(vec![Insn::Spawn(SiteId(1))], Terminator::Return);
        assert_eq!(twice.validate(), Err(AnalysisError::DuplicateSpawn(1)));
    }

    #[test]
    fn test_inline_site_rewrites_spawn_and_gets() {
        let mut body = MethodBody::new("m")
            .with_block(
                vec![Insn::Spawn(SiteId(1)), Insn::Work(2), Insn::Get(SiteId(1))],
                Terminator::Branch(1, 1),
            )
            .with_block(vec![Insn::Get(SiteId(1))], Terminator::Return);
        assert_eq!(body.size(4), 4);

        body.inline_site(SiteId(1), 7);
        assert!(!body.spawns(SiteId(1)));
        assert_eq!(
            body.blocks[0].insns,
            vec![Insn::Invoke { site: SiteId(1), cost: 7 }, Insn::Work(2)]
        );
        assert!(body.blocks[1].insns.is_empty());
        assert_eq!(body.size(4), 5);
        assert!(body.spawn_sites().is_empty());
    }
}
