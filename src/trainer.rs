//! `RewardTrainer`: fine-tunes a `RewardModel` on collated preference batches

use crate::collator::{Collator, RewardBatch};
use crate::config::{EvaluationStrategy, RewardConfig};
use crate::data::RewardDataset;
use crate::error::{RewardError, Result};
use crate::loader::RewardDataLoader;
use crate::loss::{pairwise_accuracy, pairwise_loss};
use crate::model::RewardModel;
pub use crate::model::{CONFIG_NAME, WEIGHTS_NAME};
use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use comfy_table::{presets::UTF8_FULL, Table};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

pub const TRAINING_ARGS_NAME: &str = "training_args.json";
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";

/// Metrics returned by `RewardTrainer::evaluate`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub eval_loss: f32,
    pub eval_accuracy: f32,
    pub eval_samples: usize,
    pub epoch: f64,
}

impl EvalMetrics {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("epoch", format!("{:.2}", self.epoch)),
            ("eval_accuracy", format!("{:.4}", self.eval_accuracy)),
            ("eval_loss", format!("{:.4}", self.eval_loss)),
            ("eval_samples", self.eval_samples.to_string()),
        ]
    }
}

/// One entry of the trainer's log history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub log_history: Vec<LogEntry>,
}

/// Summary returned by `RewardTrainer::train`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean training loss over all optimizer steps.
    pub training_loss: f64,
    /// Metrics from the last evaluation run during training, if any.
    pub metrics: Option<EvalMetrics>,
}

/// Learning rate after `step` optimizer steps: linear warmup, then linear decay to 0.
pub fn linear_schedule(base_lr: f64, step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    if step < warmup_steps {
        return base_lr * step as f64 / warmup_steps.max(1) as f64;
    }
    let remaining = total_steps.saturating_sub(step) as f64;
    base_lr * remaining / total_steps.saturating_sub(warmup_steps).max(1) as f64
}

/// Adds `grads` for `vars` into `acc`.
fn accumulate_grads(acc: &mut Option<GradStore>, grads: GradStore, vars: &[Var]) -> Result<()> {
    match acc {
        None => *acc = Some(grads),
        Some(acc) => {
            for var in vars {
                if let Some(grad) = grads.get(var) {
                    let summed = match acc.get(var) {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    };
                    acc.insert(var, summed);
                }
            }
        }
    }
    Ok(())
}

/// Rescales gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sq_sum += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sq_sum.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var) {
                Some(grad) => Some((grad * scale)?),
                None => None,
            };
            if let Some(scaled) = scaled {
                grads.insert(var, scaled);
            }
        }
    }
    Ok(norm)
}

/// A `comfy-table` rendering of `metrics` under a `split` heading.
pub fn metrics_table(split: &str, metrics: &EvalMetrics) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec![format!("***** {split} metrics *****"), String::new()]);
    for (name, value) in metrics.to_pairs() {
        table.add_row(vec![name.to_string(), value]);
    }
    table
}

pub struct RewardTrainer<M: RewardModel, C: Collator + Clone> {
    model: M,
    varmap: VarMap,
    args: RewardConfig,
    train_dataset: RewardDataset,
    eval_dataset: Option<RewardDataset>,
    collator: C,
    model_config: Option<serde_json::Value>,
    state: TrainerState,
}

impl<M: RewardModel, C: Collator + Clone> RewardTrainer<M, C> {
    pub fn new(
        model: M,
        varmap: VarMap,
        args: RewardConfig,
        train_dataset: RewardDataset,
        eval_dataset: Option<RewardDataset>,
        collator: C,
    ) -> Result<Self> {
        args.validate()?;
        Ok(Self {
            model,
            varmap,
            args,
            train_dataset,
            eval_dataset,
            collator,
            model_config: None,
            state: TrainerState::default(),
        })
    }

    /// Model config written to `config.json` by `save_model`.
    pub fn with_model_config<T: Serialize>(mut self, cfg: &T) -> Result<Self> {
        self.model_config = Some(serde_json::to_value(cfg)?);
        Ok(self)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn args(&self) -> &RewardConfig {
        &self.args
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Returns `(loss, chosen_rewards, rejected_rewards)` for a batch.
    fn compute_loss(&self, batch: &RewardBatch, train: bool) -> Result<(Tensor, Tensor, Tensor)> {
        let rewards_chosen = self.model.score(
            &batch.input_ids_chosen,
            &batch.attention_mask_chosen,
            train,
        )?;
        let rewards_rejected = self.model.score(
            &batch.input_ids_rejected,
            &batch.attention_mask_rejected,
            train,
        )?;
        let loss = pairwise_loss(&rewards_chosen, &rewards_rejected, batch.margin.as_ref())?;
        Ok((loss, rewards_chosen, rewards_rejected))
    }

    fn log(&mut self, values: BTreeMap<String, f64>) {
        self.state.log_history.push(LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            values,
        });
    }

    /// Runs the training loop described by the trainer's `RewardConfig`.
    pub fn train(&mut self) -> Result<TrainOutput> {
        if self.train_dataset.is_empty() {
            return Err(RewardError::EmptyDataset("train".to_string()));
        }
        let accumulation = self.args.gradient_accumulation_steps;
        let loader = RewardDataLoader::new(
            self.train_dataset.clone(),
            self.args.per_device_train_batch_size,
            true,
            false,
            self.collator.clone(),
        );
        let batches_per_epoch = loader.len();
        let steps_per_epoch = batches_per_epoch.div_ceil(accumulation);
        let total_steps = steps_per_epoch * self.args.num_train_epochs;
        self.state = TrainerState {
            max_steps: total_steps,
            ..Default::default()
        };

        let vars = self.varmap.all_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: linear_schedule(
                    self.args.learning_rate,
                    0,
                    self.args.warmup_steps,
                    total_steps,
                ),
                weight_decay: self.args.weight_decay,
                ..Default::default()
            },
        )?;
        let mut rng = StdRng::seed_from_u64(self.args.seed);

        tracing::info!(
            num_examples = self.train_dataset.len(),
            num_epochs = self.args.num_train_epochs,
            batch_size = self.args.per_device_train_batch_size,
            gradient_accumulation_steps = accumulation,
            effective_batch_size = self.args.effective_batch_size(),
            total_steps,
            "***** Running training *****"
        );

        let mut total_loss = 0f64;
        let mut loss_since_log = 0f64;
        let mut steps_since_log = 0_usize;
        let mut last_metrics = None;

        for epoch in 0..self.args.num_train_epochs {
            let mut accumulated: Option<GradStore> = None;
            let mut window_loss = 0f64;
            let mut micro_steps = 0_usize;

            for (batch_idx, batch) in loader.batcher_with_rng(&mut rng).enumerate() {
                let batch = batch?;
                let window_start = (batch_idx / accumulation) * accumulation;
                let window = std::cmp::min(accumulation, batches_per_epoch - window_start);

                let (loss, _, _) = self.compute_loss(&batch, true)?;
                let scaled = (loss / window as f64)?;
                window_loss += scaled.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                accumulate_grads(&mut accumulated, scaled.backward()?, &vars)?;
                micro_steps += 1;

                if micro_steps < window {
                    continue;
                }
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };
                let grad_norm = match self.args.max_grad_norm {
                    Some(max_norm) => Some(clip_grad_norm(&mut grads, &vars, max_norm)?),
                    None => None,
                };
                let learning_rate = optimizer.learning_rate();
                optimizer.step(&grads)?;

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (batch_idx + 1) as f64 / batches_per_epoch as f64;
                optimizer.set_learning_rate(linear_schedule(
                    self.args.learning_rate,
                    self.state.global_step,
                    self.args.warmup_steps,
                    total_steps,
                ));

                total_loss += window_loss;
                loss_since_log += window_loss;
                steps_since_log += 1;
                window_loss = 0.0;
                micro_steps = 0;

                if self.state.global_step % self.args.logging_steps == 0 {
                    let loss = loss_since_log / steps_since_log as f64;
                    tracing::info!(
                        step = self.state.global_step,
                        epoch = self.state.epoch,
                        loss,
                        learning_rate,
                        grad_norm,
                        "train"
                    );
                    let mut values = BTreeMap::from([
                        ("loss".to_string(), loss),
                        ("learning_rate".to_string(), learning_rate),
                    ]);
                    if let Some(norm) = grad_norm {
                        values.insert("grad_norm".to_string(), norm);
                    }
                    self.log(values);
                    loss_since_log = 0.0;
                    steps_since_log = 0;
                }

                if self.args.evaluation_strategy == EvaluationStrategy::Steps
                    && self.state.global_step % self.args.eval_steps == 0
                {
                    last_metrics = self.evaluate_and_log()?.or(last_metrics);
                }
            }

            if self.args.evaluation_strategy == EvaluationStrategy::Epoch {
                last_metrics = self.evaluate_and_log()?.or(last_metrics);
            }
        }

        let training_loss = total_loss / self.state.global_step.max(1) as f64;
        tracing::info!(
            global_step = self.state.global_step,
            training_loss,
            "training finished"
        );
        self.log(BTreeMap::from([(
            "train_loss".to_string(),
            training_loss,
        )]));

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics: last_metrics,
        })
    }

    /// Evaluates if an eval set is configured, recording the result in the log history.
    fn evaluate_and_log(&mut self) -> Result<Option<EvalMetrics>> {
        if self.eval_dataset.as_ref().map_or(true, |d| d.is_empty()) {
            tracing::warn!("evaluation requested but no eval dataset is set");
            return Ok(None);
        }
        let metrics = self.evaluate()?;
        self.log(BTreeMap::from([
            ("eval_loss".to_string(), metrics.eval_loss as f64),
            ("eval_accuracy".to_string(), metrics.eval_accuracy as f64),
        ]));
        Ok(Some(metrics))
    }

    /// Mean loss and accuracy over the eval dataset, weighted by batch size.
    pub fn evaluate(&self) -> Result<EvalMetrics> {
        let dataset = match &self.eval_dataset {
            Some(d) if !d.is_empty() => d.clone(),
            _ => return Err(RewardError::EmptyDataset("eval".to_string())),
        };
        let loader = RewardDataLoader::new(
            dataset,
            self.args.per_device_eval_batch_size,
            false,
            false,
            self.collator.clone(),
        );

        let mut loss_sum = 0f64;
        let mut correct = 0f64;
        let mut samples = 0_usize;
        for batch in loader.batcher() {
            let batch = batch?;
            let n = batch.batch_size();
            let (loss, chosen, rejected) = self.compute_loss(&batch, false)?;
            loss_sum += loss.to_dtype(DType::F64)?.to_scalar::<f64>()? * n as f64;
            correct += pairwise_accuracy(&chosen, &rejected)? as f64 * n as f64;
            samples += n;
        }

        let metrics = EvalMetrics {
            eval_loss: (loss_sum / samples as f64) as f32,
            eval_accuracy: (correct / samples as f64) as f32,
            eval_samples: samples,
            epoch: self.state.epoch,
        };
        tracing::info!(
            eval_loss = metrics.eval_loss,
            eval_accuracy = metrics.eval_accuracy,
            epoch = metrics.epoch,
            "eval"
        );
        Ok(metrics)
    }

    /// Writes weights, model config, training args and trainer state to `output_dir`.
    pub fn save_model<P: AsRef<Path>>(&self, output_dir: P) -> Result<PathBuf> {
        let output_dir = output_dir.as_ref();
        create_dir_all(output_dir)?;

        let weights_path = output_dir.join(WEIGHTS_NAME);
        self.varmap.save(&weights_path)?;
        if let Some(cfg) = &self.model_config {
            serde_json::to_writer_pretty(File::create(output_dir.join(CONFIG_NAME))?, cfg)?;
        }
        self.args.to_json_file(output_dir.join(TRAINING_ARGS_NAME))?;
        serde_json::to_writer_pretty(
            File::create(output_dir.join(TRAINER_STATE_NAME))?,
            &self.state,
        )?;

        tracing::info!(path = %weights_path.display(), "saved model");
        Ok(weights_path)
    }

    /// Prints `metrics` as a table.
    pub fn log_metrics(&self, split: &str, metrics: &EvalMetrics) {
        tracing::info!(
            split,
            loss = metrics.eval_loss,
            accuracy = metrics.eval_accuracy,
            samples = metrics.eval_samples,
            "metrics"
        );
        println!("{}", metrics_table(split, metrics));
    }
}
