//! Basic incremental training run over a synthetic 10-class dataset.
//!
//! Reveals two classes per cycle, trains a few epochs per cycle, bounds
//! the exemplar memory, and refreshes the frozen model, printing an epoch
//! summary as it goes.
//!
//! ```bash
//! cargo run --example basic_incremental
//! ```

use incremental_trainer_rs::config::IncrementalTrainerConfig;
use incremental_trainer_rs::models::{InMemoryDataSource, LinearSoftmax};
use incremental_trainer_rs::optim::Sgd;
use incremental_trainer_rs::prelude::*;

const FEATURES: usize = 8;
const TOTAL_CLASSES: usize = 10;
const SAMPLES_PER_CLASS: usize = 64;

fn synthetic_source() -> InMemoryDataSource {
    let mut source = InMemoryDataSource::new(16);
    for id in 0..TOTAL_CLASSES {
        let samples: Vec<Vec<f32>> = (0..SAMPLES_PER_CLASS)
            .map(|i| {
                (0..FEATURES)
                    .map(|f| {
                        let base = if (id >> (f % 4)) & 1 == 1 { 1.0 } else { -1.0 };
                        base + 0.1 * ((i + f) % 5) as f32
                    })
                    .collect()
            })
            .collect();
        source.insert_class(id, samples);
    }
    source
}

fn main() -> TrainResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = IncrementalTrainerConfig::builder()
        .total_classes(TOTAL_CLASSES)
        .step_size(2)
        .memory_budget(100)
        .lr(0.1)
        .temperature(2.0)
        .base_class_count(5)
        .schedule(vec![4])
        .gammas(vec![0.2])
        .seed(1)
        .build();

    let model = LinearSoftmax::new(FEATURES, TOTAL_CLASSES, config.seed);
    let optimizer = Sgd::from_config(&config);
    let mut trainer = IncrementalTrainer::new(model, optimizer, synthetic_source(), config)?;

    let cycles = TOTAL_CLASSES / 2;
    for cycle in 0..cycles {
        let group = trainer.reveal_next_group()?;
        tracing::info!(cycle, ?group, "revealed class group");

        for epoch in 0..6 {
            let summary = trainer.train_epoch(epoch)?;
            tracing::info!(
                cycle,
                epoch,
                batches = summary.batches,
                new_loss = summary.mean_new_loss,
                distill_loss = summary.mean_distill_loss,
                lr = summary.learning_rate,
                "epoch complete"
            );
        }

        let rebalance = trainer.setup_phase()?;
        tracing::info!(
            cycle,
            per_class = rebalance.per_class,
            classes = ?rebalance.classes,
            "exemplar memory bounded"
        );
        trainer.refresh_frozen()?;
    }

    tracing::info!(
        revealed = trainer.schedule().revealed().len(),
        older = trainer.schedule().older().len(),
        "run complete"
    );
    Ok(())
}
