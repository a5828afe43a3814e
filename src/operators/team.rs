use rand::{seq::index, RngCore};

use super::{Operator, Proposal};
use crate::{
    error::{McmcError, Result},
    graph::ModelGraph,
};

/// Applies several Metropolis-Hastings operators as one move.
///
/// Each proposal picks `size` distinct members and adds up their Hastings
/// ratios. If any member cannot move, the whole team fails. Gibbs operators
/// cannot be members.
pub struct TeamOperator {
    name: String,
    members: Vec<Box<dyn Operator>>,
    size: usize,
}

impl TeamOperator {
    pub fn new(members: Vec<Box<dyn Operator>>, size: usize) -> Result<TeamOperator> {
        if size == 0 || size > members.len() {
            return Err(McmcError::Misconfigured(format!(
                "team of {} operators cannot field {size} at once",
                members.len()
            )));
        }
        if let Some(gibbs) = members.iter().find(|m| m.is_gibbs()) {
            return Err(McmcError::Misconfigured(format!(
                "{} cannot join a team: Gibbs moves have no Hastings ratio",
                gibbs.name()
            )));
        }
        let name = format!(
            "team({})",
            members.iter().map(|m| m.name()).collect::<Vec<_>>().join(",")
        );
        Ok(TeamOperator {
            name,
            members,
            size,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> TeamOperator {
        self.name = name.into();
        self
    }
}

impl Operator for TeamOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let chosen = index::sample(rng, self.members.len(), self.size);
        let mut log_hastings_ratio = 0.;
        for k in chosen.iter() {
            let member = &mut self.members[k];
            match member.propose(graph, rng)? {
                Proposal::Move {
                    log_hastings_ratio: ratio,
                } => log_hastings_ratio += ratio,
                Proposal::Failed => return Ok(Proposal::Failed),
                Proposal::Gibbs => {
                    return Err(McmcError::Misconfigured(format!(
                        "{} cannot join a team: Gibbs moves have no Hastings ratio",
                        member.name()
                    )))
                }
            }
        }
        Ok(Proposal::Move { log_hastings_ratio })
    }
}
