use anyhow::Result;
use arrow::array::Array;
use phylo_mcmc::{
    chain_rng,
    operators::{
        BitMoveOperator, ExchangeOperator, RandomWalkOperator, Scalable, ScaleOperator,
        SubtreeSlideOperator, UpDownOperator, WilsonBaldingOperator,
    },
    sample_parallel, sample_parallel_until, Acceptance, Acceptor, Bounds, ChainSetup,
    CompoundLikelihood, ConstantCoalescentLikelihood, Distribution, DistributionLikelihood,
    MarkovChain, McmcError, McmcSettings, ModelGraph, Operator, OperatorSchedule, Parameter,
    RunOutcome, StateLoader, StepOutcome, StopHandle, Tree,
};
use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn coalescent_setup() -> Result<ChainSetup> {
    let mut graph = ModelGraph::new();
    let size = graph.add_parameter(Parameter::scalar("N", 1.).with_bounds(Bounds::POSITIVE))?;
    let tree = graph.add_tree(Tree::from_newick(
        "tree",
        "(((a:0.5,b:0.5):0.5,c:1):1,(d:1.5,e:1.5):0.5);",
    )?)?;
    let prior = graph.add_model(DistributionLikelihood::new(
        "N.prior",
        size,
        Distribution::LogNormal { mu: 0., sigma: 1. },
    ))?;
    let coalescent = graph.add_model(ConstantCoalescentLikelihood::new("coalescent", tree, size))?;
    let posterior =
        graph.add_model(CompoundLikelihood::new("posterior", vec![prior, coalescent]))?;

    let mut schedule = OperatorSchedule::new();
    schedule.add(ScaleOperator::new(size, 0.75)?, 1.)?;
    schedule.add(SubtreeSlideOperator::new(tree, 0.5)?, 3.)?;
    schedule.add(ExchangeOperator::narrow(tree), 1.)?;
    schedule.add(WilsonBaldingOperator::new(tree), 1.)?;
    schedule.add(
        UpDownOperator::new(
            vec![Scalable::Parameter(size)],
            vec![Scalable::TreeHeights(tree)],
            0.75,
        )?,
        1.,
    )?;
    Ok(ChainSetup {
        graph,
        posterior,
        schedule,
    })
}

fn uniform_chain(start: f64) -> std::result::Result<MarkovChain<ChaCha8Rng>, McmcError> {
    let mut graph = ModelGraph::new();
    let x = graph.add_parameter(Parameter::scalar("x", start))?;
    let target = graph.add_model(DistributionLikelihood::new(
        "target",
        x,
        Distribution::Uniform {
            lower: 0.,
            upper: 1.,
        },
    ))?;
    let posterior = graph.add_model(CompoundLikelihood::new("posterior", vec![target]))?;
    let mut schedule = OperatorSchedule::new();
    schedule.add(RandomWalkOperator::new(x, 2.)?, 1.)?;
    MarkovChain::new(
        graph,
        posterior,
        schedule,
        McmcSettings::default(),
        ChaCha8Rng::seed_from_u64(300),
    )
}

#[test]
fn zero_density_states_are_never_entered() -> Result<()> {
    assert!(matches!(
        uniform_chain(3.),
        Err(McmcError::InvalidInitialState(_))
    ));

    let mut chain = uniform_chain(0.5)?;
    let x = chain.graph().parameter_by_name("x").expect("x exists");
    let mut rejected = 0;
    for _ in 0..5000 {
        if chain.step()? == StepOutcome::Rejected {
            rejected += 1;
        }
        let value = chain.graph().parameter(x).value(0);
        assert!((0. ..=1.).contains(&value));
        assert!(chain.current_score().is_finite());
    }
    assert!(rejected > 0);
    Ok(())
}

#[test]
fn failed_operator_leaves_state_untouched() -> Result<()> {
    let mut graph = ModelGraph::new();
    let bits = graph.add_parameter(Parameter::new("bits", vec![0.; 5]).with_bounds(Bounds::UNIT))?;
    let flat = graph.add_model(DistributionLikelihood::new(
        "flat",
        bits,
        Distribution::Uniform {
            lower: -1.,
            upper: 2.,
        },
    ))?;
    let posterior = graph.add_model(CompoundLikelihood::new("posterior", vec![flat]))?;
    let mut schedule = OperatorSchedule::new();
    schedule.add(BitMoveOperator::new(bits), 1.)?;
    let settings = McmcSettings {
        full_evaluation_count: 0,
        ..McmcSettings::default()
    };
    let mut chain = MarkovChain::new(
        graph,
        posterior,
        schedule,
        settings,
        ChaCha8Rng::seed_from_u64(301),
    )?;

    let before = chain.graph().fingerprint();
    let score = chain.current_score();
    for iteration in 1..=10 {
        assert_eq!(chain.step()?, StepOutcome::OperatorFailed);
        assert_eq!(chain.iteration(), iteration);
    }
    assert_eq!(chain.graph().fingerprint(), before);
    assert_eq!(chain.current_score().to_bits(), score.to_bits());
    assert_eq!(chain.schedule().stats(0).failed, 10);
    Ok(())
}

#[test]
fn parallel_chains_are_reproducible() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("phylo-mcmc-parallel-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let settings = McmcSettings {
        chain_length: 2000,
        num_chains: 3,
        seed: 7,
        log_every: 100,
        checkpoint_dir: Some(dir.clone()),
        ..McmcSettings::default()
    };

    let first = sample_parallel(&settings, |_| coalescent_setup())?;
    let second = sample_parallel(
        &McmcSettings {
            checkpoint_dir: None,
            ..settings.clone()
        },
        |_| coalescent_setup(),
    )?;
    assert_eq!(first.len(), 3);
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.chain, b.chain);
        assert_eq!(a.outcome, RunOutcome::Completed);
        assert_eq!(a.iterations, 2000);
        assert_eq!(a.final_score.to_bits(), b.final_score.to_bits());
        assert!(a.best_score >= a.final_score);
        assert_eq!(a.trace.len(), 21);
        assert_eq!(a.operators.len(), 5);
        let used: u64 = a.operators.iter().map(|(_, stats)| stats.count()).sum();
        assert_eq!(used, 2000);
    }
    assert_ne!(first[0].final_score, first[1].final_score);

    // Resuming from the checkpoint continues the interrupted run exactly,
    // whatever generator the new chain was built with.
    let loader = StateLoader::default();
    let checkpoint = loader.read(dir.join("chain-1.json"))?;
    assert_eq!(checkpoint.state.iteration, 2000);
    assert!(checkpoint.state.rng.is_some());
    let setup = coalescent_setup()?;
    let mut resumed = MarkovChain::new(
        setup.graph,
        setup.posterior,
        setup.schedule,
        settings.clone(),
        chain_rng(12345, 0),
    )?;
    loader.restore(&checkpoint, &mut resumed)?;
    assert_eq!(resumed.current_score().to_bits(), first[1].final_score.to_bits());
    resumed.run(300)?;
    assert_eq!(resumed.iteration(), 2300);

    let uninterrupted = sample_parallel(
        &McmcSettings {
            chain_length: 2300,
            checkpoint_dir: None,
            ..settings.clone()
        },
        |_| coalescent_setup(),
    )?;
    assert_eq!(
        resumed.current_score().to_bits(),
        uninterrupted[1].final_score.to_bits()
    );
    for (index, (_, stats)) in uninterrupted[1].operators.iter().enumerate() {
        assert_eq!(resumed.schedule().stats(index), *stats);
    }

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

/// Turns every proposal down.
struct RejectAll;

impl Acceptor for RejectAll {
    fn accept(&mut self, _: f64, _: f64, _: f64, _: &mut dyn RngCore) -> Acceptance {
        Acceptance {
            accept: false,
            log_alpha: f64::NEG_INFINITY,
        }
    }
}

fn normal_chain(start: f64) -> Result<MarkovChain<ChaCha8Rng>> {
    let mut graph = ModelGraph::new();
    let x = graph.add_parameter(Parameter::scalar("x", start))?;
    let target = graph.add_model(DistributionLikelihood::new(
        "target",
        x,
        Distribution::Normal { mean: 0., sd: 1. },
    ))?;
    let posterior = graph.add_model(CompoundLikelihood::new("posterior", vec![target]))?;
    let mut schedule = OperatorSchedule::new();
    schedule.add(RandomWalkOperator::new(x, 2.)?, 1.)?;
    Ok(MarkovChain::new(
        graph,
        posterior,
        schedule,
        McmcSettings::default(),
        ChaCha8Rng::seed_from_u64(302),
    )?)
}

#[test]
fn best_state_is_a_visited_state() -> Result<()> {
    // Starting in the tail, most proposals score higher than the start.
    let mut chain = normal_chain(3.)?.with_acceptor(RejectAll);
    let start = chain.current_score();
    for _ in 0..100 {
        assert_eq!(chain.step()?, StepOutcome::Rejected);
    }
    assert_eq!(chain.current_score().to_bits(), start.to_bits());
    assert_eq!(chain.best_score().to_bits(), chain.current_score().to_bits());

    let mut chain = normal_chain(3.)?;
    let mut best = chain.current_score();
    for _ in 0..2000 {
        chain.step()?;
        best = best.max(chain.current_score());
        assert_eq!(chain.best_score().to_bits(), best.to_bits());
    }
    Ok(())
}

#[test]
fn stopped_chains_return_early() -> Result<()> {
    let stop = StopHandle::default();
    stop.stop();
    let settings = McmcSettings {
        chain_length: 1000,
        num_chains: 2,
        ..McmcSettings::default()
    };
    let outputs = sample_parallel_until(&settings, |_| coalescent_setup(), &stop)?;
    for output in outputs {
        assert_eq!(output.outcome, RunOutcome::Stopped);
        assert_eq!(output.iterations, 0);
    }

    let failing = sample_parallel(&settings, |chain| {
        if chain == 1 {
            anyhow::bail!("no model for chain {chain}");
        }
        coalescent_setup()
    });
    assert!(failing.is_err());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn proposals_restore_exactly(seed in any::<u64>(), choice in 0usize..5, moves in 1usize..30) {
        let ChainSetup { mut graph, posterior, schedule } = coalescent_setup().unwrap();
        drop(schedule);
        let size = graph.parameter_by_name("N").unwrap();
        let tree = graph.tree_by_name("tree").unwrap();
        let mut operator: Box<dyn Operator> = match choice {
            0 => Box::new(ScaleOperator::new(size, 0.5).unwrap()),
            1 => Box::new(SubtreeSlideOperator::new(tree, 1.).unwrap().gaussian()),
            2 => Box::new(ExchangeOperator::wide(tree)),
            3 => Box::new(WilsonBaldingOperator::new(tree)),
            _ => Box::new(
                UpDownOperator::new(vec![Scalable::TreeHeights(tree)], vec![], 0.5).unwrap(),
            ),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let score = graph.evaluate(posterior).unwrap();
        let before = graph.fingerprint();
        for _ in 0..moves {
            graph.store().unwrap();
            operator.propose(&mut graph, &mut rng).unwrap();
            graph.evaluate(posterior).unwrap();
            graph.restore().unwrap();
            prop_assert_eq!(&graph.fingerprint(), &before);
        }
        prop_assert_eq!(graph.evaluate(posterior).unwrap().to_bits(), score.to_bits());
    }
}
