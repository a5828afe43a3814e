use anyhow::Result;
use phylo_mcmc::{
    operators::{
        BitFlipOperator, ExchangeOperator, Scalable, SubtreeSlideOperator, UpDownOperator,
        WilsonBaldingOperator,
    },
    Bounds, CompoundLikelihood, ConstantCoalescentLikelihood, Distribution,
    DistributionLikelihood, MarkovChain, McmcSettings, ModelGraph, OperatorSchedule, Parameter,
    Tree,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[test]
fn coalescent_root_height() -> Result<()> {
    let mut graph = ModelGraph::new();
    let size = graph.add_parameter(Parameter::scalar("N", 1.).with_bounds(Bounds::POSITIVE))?;
    let tree = graph.add_tree(Tree::from_newick(
        "tree",
        "((a:1,b:1):1,(c:0.5,d:0.5):1.5);",
    )?)?;
    let coalescent = graph.add_model(ConstantCoalescentLikelihood::new("coalescent", tree, size))?;
    let posterior = graph.add_model(CompoundLikelihood::new("posterior", vec![coalescent]))?;

    let mut schedule = OperatorSchedule::new();
    schedule.add(SubtreeSlideOperator::new(tree, 0.5)?, 3.)?;
    schedule.add(ExchangeOperator::narrow(tree), 1.)?;
    schedule.add(ExchangeOperator::wide(tree), 1.)?;
    schedule.add(WilsonBaldingOperator::new(tree), 1.)?;
    schedule.add(
        UpDownOperator::new(vec![Scalable::TreeHeights(tree)], vec![], 0.75)?,
        2.,
    )?;
    let mut chain = MarkovChain::new(
        graph,
        posterior,
        schedule,
        McmcSettings::default(),
        ChaCha8Rng::seed_from_u64(200),
    )?;

    chain.run(5000)?;
    let samples = 300_000;
    let mut total = 0.;
    for _ in 0..samples {
        chain.step()?;
        let tree = chain.graph().tree(tree);
        assert!(tree.is_valid());
        total += tree.height(tree.root());
    }
    // Expected time to the most recent common ancestor: 2 N (1 - 1/n).
    approx::assert_abs_diff_eq!(total / samples as f64, 1.5, epsilon = 0.1);
    Ok(())
}

#[test]
fn bit_flip_with_prior_on_sum_is_uniform_in_count() -> Result<()> {
    let dim = 4;
    let mut graph = ModelGraph::new();
    let indicators = graph.add_parameter(
        Parameter::new("indicators", vec![0.; dim]).with_bounds(Bounds::UNIT),
    )?;
    let flat = graph.add_model(DistributionLikelihood::new(
        "flat",
        indicators,
        Distribution::Uniform {
            lower: -1.,
            upper: 2.,
        },
    ))?;
    let posterior = graph.add_model(CompoundLikelihood::new("posterior", vec![flat]))?;

    let mut schedule = OperatorSchedule::new();
    schedule.add(BitFlipOperator::new(indicators).prior_on_sum(), 1.)?;
    let mut chain = MarkovChain::new(
        graph,
        posterior,
        schedule,
        McmcSettings::default(),
        ChaCha8Rng::seed_from_u64(201),
    )?;

    let samples = 100_000;
    let mut counts = vec![0usize; dim + 1];
    for _ in 0..samples {
        chain.step()?;
        counts[chain.graph().parameter(indicators).count_ones()] += 1;
    }
    for count in counts {
        approx::assert_abs_diff_eq!(count as f64 / samples as f64, 0.2, epsilon = 0.02);
    }
    Ok(())
}
