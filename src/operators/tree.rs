//! Moves on time trees.
//!
//! Every topology move rewires nodes inside one [`ModelGraph::edit_tree`]
//! call, so listeners see a single consistent change. Node choices are made
//! uniformly over the eligible nodes; when no eligible node exists the move
//! fails.

use rand::{seq::IndexedRandom, Rng, RngCore};
use rand_distr::{Distribution as _, StandardNormal};

use super::{CoercionMode, Operator, Proposal};
use crate::{
    error::{McmcError, Result},
    graph::ModelGraph,
    model::TreeId,
    tree::Tree,
};

/// Number of branches crossing `height` in the subtree hanging from the
/// branch above `node`. Lower ends of crossing branches go to `crossing`.
fn intersecting_edges(
    tree: &Tree,
    node: usize,
    height: f64,
    mut crossing: Option<&mut Vec<usize>>,
) -> usize {
    let Some(parent) = tree.parent(node) else {
        return 0;
    };
    if tree.height(parent) < height {
        return 0;
    }
    if tree.height(node) < height {
        if let Some(crossing) = crossing {
            crossing.push(node);
        }
        return 1;
    }
    let mut count = 0;
    for child in tree.children(node) {
        count += intersecting_edges(tree, child, height, crossing.as_deref_mut());
    }
    count
}

fn non_root_nodes(tree: &Tree) -> Vec<usize> {
    (0..tree.node_count()).filter(|&n| !tree.is_root(n)).collect()
}

/// Slides the parent of a random node up or down, possibly past other
/// nodes, which then changes the topology.
#[derive(Debug, Clone)]
pub struct SubtreeSlideOperator {
    name: String,
    tree: TreeId,
    size: f64,
    gaussian: bool,
    mode: CoercionMode,
}

impl SubtreeSlideOperator {
    pub fn new(tree: TreeId, size: f64) -> Result<SubtreeSlideOperator> {
        if !(size > 0. && size.is_finite()) {
            return Err(McmcError::Misconfigured(format!(
                "subtree slide size must be positive, got {size}"
            )));
        }
        Ok(SubtreeSlideOperator {
            name: "subtreeSlide".into(),
            tree,
            size,
            gaussian: false,
            mode: CoercionMode::Default,
        })
    }

    /// Draw the height change from `Normal(0, size)` instead of
    /// `U(-size/2, size/2)`.
    pub fn gaussian(mut self) -> SubtreeSlideOperator {
        self.gaussian = true;
        self
    }

    pub fn with_coercion(mut self, mode: CoercionMode) -> SubtreeSlideOperator {
        self.mode = mode;
        self
    }

    fn delta(&self, rng: &mut dyn RngCore) -> f64 {
        if self.gaussian {
            let z: f64 = StandardNormal.sample(rng);
            z * self.size
        } else {
            rng.random::<f64>() * self.size - self.size / 2.
        }
    }
}

impl Operator for SubtreeSlideOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let tree = graph.tree(self.tree);
        let candidates = non_root_nodes(tree);
        let Some(&i) = candidates.choose(rng) else {
            return Ok(Proposal::Failed);
        };
        let Some(i_parent) = tree.parent(i) else {
            return Ok(Proposal::Failed);
        };
        let Some(sibling) = tree.other_child(i_parent, i) else {
            return Ok(Proposal::Failed);
        };
        let grandparent = tree.parent(i_parent);
        let old_height = tree.height(i_parent);
        let new_height = old_height + self.delta(rng);

        if new_height > old_height {
            let Some(grandparent) = grandparent.filter(|&g| tree.height(g) < new_height) else {
                graph.set_node_height(self.tree, i_parent, new_height);
                return Ok(Proposal::symmetric());
            };
            // Climb to the branch the new height falls on.
            let mut new_child = grandparent;
            let mut new_parent = tree.parent(grandparent);
            while let Some(parent) = new_parent {
                if tree.height(parent) >= new_height {
                    break;
                }
                new_child = parent;
                new_parent = tree.parent(parent);
            }

            let sources = graph.edit_tree(self.tree, |tree| {
                tree.remove_child(i_parent, sibling);
                tree.remove_child(grandparent, i_parent);
                tree.add_child(grandparent, sibling);
                match new_parent {
                    Some(new_parent) => {
                        tree.remove_child(new_parent, new_child);
                        tree.add_child(new_parent, i_parent);
                        tree.add_child(i_parent, new_child);
                    }
                    None => {
                        tree.add_child(i_parent, new_child);
                        tree.set_root(i_parent);
                    }
                }
                tree.set_height(i_parent, new_height);
                intersecting_edges(tree, new_child, old_height, None)
            });
            Ok(Proposal::Move {
                log_hastings_ratio: -(sources as f64).ln(),
            })
        } else {
            if tree.height(i) > new_height {
                return Ok(Proposal::Failed);
            }
            if tree.height(sibling) <= new_height {
                graph.set_node_height(self.tree, i_parent, new_height);
                return Ok(Proposal::symmetric());
            }
            let mut crossing = Vec::new();
            let destinations = intersecting_edges(tree, sibling, new_height, Some(&mut crossing));
            let Some(&new_child) = crossing.choose(rng) else {
                return Ok(Proposal::Failed);
            };
            let Some(new_parent) = tree.parent(new_child) else {
                return Ok(Proposal::Failed);
            };

            graph.edit_tree(self.tree, |tree| {
                match grandparent {
                    Some(grandparent) => {
                        tree.remove_child(i_parent, sibling);
                        tree.remove_child(grandparent, i_parent);
                        tree.add_child(grandparent, sibling);
                    }
                    None => {
                        tree.remove_child(i_parent, sibling);
                        tree.set_root(sibling);
                    }
                }
                tree.remove_child(new_parent, new_child);
                tree.add_child(new_parent, i_parent);
                tree.add_child(i_parent, new_child);
                tree.set_height(i_parent, new_height);
            });
            Ok(Proposal::Move {
                log_hastings_ratio: (destinations as f64).ln(),
            })
        }
    }

    fn coercable_parameter(&self) -> Option<f64> {
        Some(self.size.ln())
    }

    fn set_coercable_parameter(&mut self, value: f64) {
        self.size = value.exp();
    }

    fn raw_parameter(&self) -> Option<f64> {
        Some(self.size)
    }

    fn set_raw_parameter(&mut self, value: f64) {
        self.size = value;
    }

    fn coercion_mode(&self) -> CoercionMode {
        self.mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Swap a node with its uncle.
    Narrow,
    /// Swap two arbitrary nodes whose parents are old enough.
    Wide,
}

/// Exchanges two subtrees without changing any node height.
#[derive(Debug, Clone)]
pub struct ExchangeOperator {
    name: String,
    tree: TreeId,
    kind: ExchangeKind,
}

impl ExchangeOperator {
    pub fn narrow(tree: TreeId) -> ExchangeOperator {
        ExchangeOperator {
            name: "narrowExchange".into(),
            tree,
            kind: ExchangeKind::Narrow,
        }
    }

    pub fn wide(tree: TreeId) -> ExchangeOperator {
        ExchangeOperator {
            name: "wideExchange".into(),
            tree,
            kind: ExchangeKind::Wide,
        }
    }

    fn choose_narrow(tree: &Tree, rng: &mut dyn RngCore) -> Option<(usize, usize, usize, usize)> {
        let candidates: Vec<usize> = (0..tree.node_count())
            .filter(|&n| tree.parent(n).is_some_and(|p| !tree.is_root(p)))
            .collect();
        let &i = candidates.choose(rng)?;
        let i_parent = tree.parent(i)?;
        let grandparent = tree.parent(i_parent)?;
        let uncle = tree.other_child(grandparent, i_parent)?;
        (tree.height(uncle) < tree.height(i_parent)).then_some((i, uncle, i_parent, grandparent))
    }

    fn choose_wide(tree: &Tree, rng: &mut dyn RngCore) -> Option<(usize, usize, usize, usize)> {
        let candidates = non_root_nodes(tree);
        let &i = candidates.choose(rng)?;
        let others: Vec<usize> = candidates.iter().copied().filter(|&j| j != i).collect();
        let &j = others.choose(rng)?;
        let i_parent = tree.parent(i)?;
        let j_parent = tree.parent(j)?;
        let valid = i_parent != j_parent
            && i != j_parent
            && j != i_parent
            && tree.height(j) < tree.height(i_parent)
            && tree.height(i) < tree.height(j_parent);
        valid.then_some((i, j, i_parent, j_parent))
    }
}

impl Operator for ExchangeOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let tree = graph.tree(self.tree);
        let choice = match self.kind {
            ExchangeKind::Narrow => ExchangeOperator::choose_narrow(tree, rng),
            ExchangeKind::Wide => ExchangeOperator::choose_wide(tree, rng),
        };
        let Some((i, j, i_parent, j_parent)) = choice else {
            return Ok(Proposal::Failed);
        };
        graph.edit_tree(self.tree, |tree| tree.exchange(i, j, i_parent, j_parent));
        Ok(Proposal::symmetric())
    }
}

/// Prunes a random subtree and regrafts it onto a random branch that is
/// older than the subtree's root, drawing the new attachment height
/// uniformly. Moves that would change the root fail.
#[derive(Debug, Clone)]
pub struct WilsonBaldingOperator {
    name: String,
    tree: TreeId,
}

impl WilsonBaldingOperator {
    pub fn new(tree: TreeId) -> WilsonBaldingOperator {
        WilsonBaldingOperator {
            name: "wilsonBalding".into(),
            tree,
        }
    }
}

impl Operator for WilsonBaldingOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RngCore) -> Result<Proposal> {
        let tree = graph.tree(self.tree);
        let candidates = non_root_nodes(tree);
        let Some(&i) = candidates.choose(rng) else {
            return Ok(Proposal::Failed);
        };
        let Some(i_parent) = tree.parent(i) else {
            return Ok(Proposal::Failed);
        };
        let Some(grandparent) = tree.parent(i_parent) else {
            return Ok(Proposal::Failed);
        };
        let height_i = tree.height(i);
        let destinations: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&j| j != i && tree.parent(j).is_some_and(|k| tree.height(k) > height_i))
            .collect();
        let Some(&j) = destinations.choose(rng) else {
            return Ok(Proposal::Failed);
        };
        let Some(k) = tree.parent(j) else {
            return Ok(Proposal::Failed);
        };
        if j == i_parent || k == i_parent {
            return Ok(Proposal::Failed);
        }
        let Some(sibling) = tree.other_child(i_parent, i) else {
            return Ok(Proposal::Failed);
        };

        let new_min = height_i.max(tree.height(j));
        let new_range = tree.height(k) - new_min;
        let old_min = height_i.max(tree.height(sibling));
        let old_range = tree.height(grandparent) - old_min;
        let new_height = new_min + rng.random::<f64>() * new_range;
        let log_hastings_ratio = if old_range == 0. || new_range == 0. {
            0.
        } else {
            (new_range / old_range.abs()).ln()
        };

        graph.edit_tree(self.tree, |tree| {
            tree.remove_child(i_parent, sibling);
            tree.remove_child(grandparent, i_parent);
            tree.add_child(grandparent, sibling);
            tree.remove_child(k, j);
            tree.add_child(i_parent, j);
            tree.add_child(k, i_parent);
            tree.set_height(i_parent, new_height);
        });
        Ok(Proposal::Move { log_hastings_ratio })
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{intersecting_edges, ExchangeOperator, SubtreeSlideOperator, WilsonBaldingOperator};
    use crate::{
        graph::ModelGraph,
        likelihood::{CompoundLikelihood, ConstantCoalescentLikelihood, MonophylyLikelihood},
        model::{ModelId, TreeId},
        operators::{test_support::assert_restores, Operator, Proposal},
        parameter::{Bounds, Parameter},
        tree::{TipSet, Tree},
    };

    const NEWICK: &str = "(((a:1,b:1):1,c:2):2,((d:0.5,e:0.5):2,f:2.5):1.5);";

    fn setup() -> (ModelGraph, TreeId, ModelId) {
        let mut graph = ModelGraph::new();
        let tree = graph.add_tree(Tree::from_newick("t", NEWICK).unwrap()).unwrap();
        let n = graph
            .add_parameter(Parameter::scalar("N", 2.).with_bounds(Bounds::POSITIVE))
            .unwrap();
        let coalescent = graph
            .add_model(ConstantCoalescentLikelihood::new("coalescent", tree, n))
            .unwrap();
        let clade = graph
            .add_model(MonophylyLikelihood::new("de", tree, vec!["d".into(), "e".into()]))
            .unwrap();
        let posterior = graph
            .add_model(CompoundLikelihood::new("posterior", vec![coalescent, clade]))
            .unwrap();
        (graph, tree, posterior)
    }

    #[test]
    fn crossing_edges() {
        let tree = Tree::from_newick("t", NEWICK).unwrap();
        // At height 1.5 the left subtree of the root is cut by the branches
        // above (a,b) and c.
        let ab = tree.mrca(&TipSet::from_tips(6, [0, 1]));
        let left = tree.parent(ab).unwrap();
        let mut crossing = Vec::new();
        assert_eq!(intersecting_edges(&tree, left, 1.5, Some(&mut crossing)), 2);
        crossing.sort();
        assert_eq!(crossing, vec![2, ab]);
        assert_eq!(intersecting_edges(&tree, tree.root(), 1., None), 0);
    }

    #[test]
    fn moves_keep_trees_valid() {
        let (mut graph, tree, _) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut operators: Vec<Box<dyn Operator>> = vec![
            Box::new(SubtreeSlideOperator::new(tree, 1.).unwrap()),
            Box::new(SubtreeSlideOperator::new(tree, 1.).unwrap().gaussian()),
            Box::new(ExchangeOperator::narrow(tree)),
            Box::new(ExchangeOperator::wide(tree)),
            Box::new(WilsonBaldingOperator::new(tree)),
        ];
        for op in operators.iter_mut() {
            for _ in 0..2000 {
                graph.store().unwrap();
                let proposal = op.propose(&mut graph, &mut rng).unwrap();
                let valid = graph.tree(tree).is_valid();
                if proposal != Proposal::Failed && valid {
                    graph.accept().unwrap();
                } else {
                    graph.restore().unwrap();
                }
                assert!(graph.tree(tree).is_valid());
                assert_eq!(graph.tree(tree).clade(graph.tree(tree).root()).len(), 6);
            }
        }
    }

    #[test]
    fn tree_moves_restore_exactly() {
        let (mut graph, tree, posterior) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let mut slide = SubtreeSlideOperator::new(tree, 1.5).unwrap();
        assert_restores(&mut graph, posterior, &mut slide, &mut rng, 10_000);
        let mut narrow = ExchangeOperator::narrow(tree);
        assert_restores(&mut graph, posterior, &mut narrow, &mut rng, 10_000);
        let mut wide = ExchangeOperator::wide(tree);
        assert_restores(&mut graph, posterior, &mut wide, &mut rng, 10_000);
        let mut wilson_balding = WilsonBaldingOperator::new(tree);
        assert_restores(&mut graph, posterior, &mut wilson_balding, &mut rng, 10_000);
    }

    #[test]
    fn two_tip_exchange_fails() {
        let mut graph = ModelGraph::new();
        let tree = graph
            .add_tree(Tree::from_newick("t", "(a:1,b:1);").unwrap())
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        assert_eq!(
            ExchangeOperator::narrow(tree).propose(&mut graph, &mut rng).unwrap(),
            Proposal::Failed
        );
        assert_eq!(
            ExchangeOperator::wide(tree).propose(&mut graph, &mut rng).unwrap(),
            Proposal::Failed
        );
        assert_eq!(
            WilsonBaldingOperator::new(tree).propose(&mut graph, &mut rng).unwrap(),
            Proposal::Failed
        );
    }
}
