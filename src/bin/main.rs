use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reward_modeling_rs::{
    collator::{RewardDataCollatorWithPadding, ZeroPadRewardCollator},
    config::{
        EvaluationStrategy, RewardConfig, ScriptArguments, TokenizerSetup, DATA_DIR,
        DEFAULT_BASE_MODEL, DEFAULT_DATASET, DEFAULT_SPLIT,
    },
    data::{
        download_preference_rows, load_preference_rows, split_eval_rows, PreferenceRow,
        RewardDataset,
    },
    model::{PooledRewardModel, RewardModelConfig},
    tldr::{self, Comparison, SftRecord},
    tokenizer::{hub_eos_token, Gpt2Tokenizer, HfTokenizer, TextTokenizer},
    trainer::RewardTrainer,
};
use std::path::{Path, PathBuf};

/// CLI
#[derive(Debug, Parser)]
#[command(name = "reward-modeling-rs")]
#[command(about = "A CLI for training reward models on preference pairs.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a reward model, save it and evaluate it
    Train(TrainArgs),
    /// Convert TL;DR comparison data into prompt/chosen/rejected rows
    PrepareTldr(PrepareTldrArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TokenizerKind {
    /// GPT-2 BPE bundled with tiktoken
    Gpt2,
    /// `tokenizer.json` of `--base-model` from the model hub
    Hub,
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// JSON file with training arguments; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Local `.json`/`.jsonl` preference file; downloads the dataset if absent
    #[arg(long)]
    dataset_file: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_DATASET)]
    dataset_name: String,
    #[arg(long, default_value = "default")]
    dataset_config: String,
    #[arg(long, default_value = DEFAULT_SPLIT)]
    dataset_split: String,
    /// Trailing rows held out for evaluation
    #[arg(long, default_value_t = 20)]
    eval_samples: usize,
    #[arg(long, value_enum, default_value_t = TokenizerKind::Hub)]
    tokenizer: TokenizerKind,
    #[arg(long, default_value = DEFAULT_BASE_MODEL)]
    base_model: String,
    /// Padding token registered with the tokenizer [default: [PAD]]
    #[arg(long)]
    pad_token: Option<String>,
    /// End-of-sequence token; read from the hub `tokenizer_config.json` if unset
    #[arg(long)]
    eos_token: Option<String>,
    /// Directory written by a previous run (`config.json`, `model.safetensors`)
    /// to start training from
    #[arg(long)]
    init_checkpoint: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<String>,
    #[arg(long)]
    num_train_epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    per_device_train_batch_size: Option<usize>,
    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,
    #[arg(long, value_enum)]
    evaluation_strategy: Option<EvaluationStrategy>,
    #[arg(long)]
    pad_to_multiple_of: Option<usize>,
}

#[derive(Debug, Args)]
struct PrepareTldrArgs {
    /// Directory of `<split>.jsonl` comparison files
    #[arg(long)]
    comparisons_dir: PathBuf,
    /// Directory of `<split>.jsonl` supervised summaries
    #[arg(long)]
    sft_dir: Option<PathBuf>,
    #[arg(long, default_value = "data/tldr")]
    output_dir: PathBuf,
    /// Keep only the first 50 rows of every split
    #[arg(long)]
    debug: bool,
}

impl TrainArgs {
    fn training_args(&self) -> anyhow::Result<RewardConfig> {
        let mut cfg = match &self.config {
            Some(path) => RewardConfig::from_json_file(path)
                .with_context(|| format!("Unable to load config {}", path.display()))?,
            None => RewardConfig::default(),
        };
        if let Some(output_dir) = &self.output_dir {
            cfg.output_dir = output_dir.clone();
        }
        if let Some(epochs) = self.num_train_epochs {
            cfg.num_train_epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            cfg.learning_rate = lr;
        }
        if let Some(batch_size) = self.per_device_train_batch_size {
            cfg.per_device_train_batch_size = batch_size;
        }
        if let Some(steps) = self.gradient_accumulation_steps {
            cfg.gradient_accumulation_steps = steps;
        }
        if let Some(strategy) = self.evaluation_strategy {
            cfg.evaluation_strategy = strategy;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn tokenizer_setup(&self) -> anyhow::Result<TokenizerSetup> {
        let mut setup = TokenizerSetup::default();
        if let Some(pad_token) = &self.pad_token {
            setup.pad_token = pad_token.clone();
        }
        match (&self.eos_token, self.tokenizer) {
            (Some(eos_token), _) => setup.eos_token = eos_token.clone(),
            (None, TokenizerKind::Hub) => {
                if let Some(eos_token) = hub_eos_token(&self.base_model)? {
                    setup.eos_token = eos_token;
                }
            }
            (None, TokenizerKind::Gpt2) => {}
        }
        Ok(setup)
    }

    fn script_args(&self) -> ScriptArguments {
        ScriptArguments {
            base_model: self.base_model.clone(),
            dataset_name: self.dataset_name.clone(),
            dataset_config: self.dataset_config.clone(),
            dataset_split: self.dataset_split.clone(),
            eval_samples: self.eval_samples,
        }
    }
}

fn train(args: TrainArgs) -> anyhow::Result<()> {
    let training_args = args.training_args()?;
    let script_args = args.script_args();
    let setup = args.tokenizer_setup()?;

    // tokenizer
    let tokenizer: Box<dyn TextTokenizer> = match args.tokenizer {
        TokenizerKind::Gpt2 => Box::new(Gpt2Tokenizer::new(&setup)?),
        TokenizerKind::Hub => Box::new(HfTokenizer::from_hub(&script_args.base_model, &setup)?),
    };

    // dataset
    let rows = match &args.dataset_file {
        Some(path) => load_preference_rows(path)
            .with_context(|| format!("Unable to read {}", path.display()))?,
        None => {
            let cache_name = format!(
                "{}_{}.jsonl",
                script_args.dataset_name.replace('/', "__"),
                script_args.dataset_split
            );
            download_preference_rows(
                &script_args.dataset_name,
                &script_args.dataset_config,
                &script_args.dataset_split,
                Path::new(DATA_DIR).join(cache_name),
            )?
        }
    };
    let (train_rows, eval_rows) = split_eval_rows(&rows, script_args.eval_samples)?;
    let build = |rows: &[PreferenceRow]| {
        RewardDataset::new(
            rows,
            tokenizer.as_ref(),
            &setup.chat_template,
            training_args.max_length,
        )
    };
    let train_dataset = build(train_rows)?;
    let eval_dataset = build(eval_rows)?;
    tracing::info!(
        train = train_dataset.len(),
        eval = eval_dataset.len(),
        "prepared datasets"
    );

    // model
    let device = Device::cuda_if_available(0)?;
    let longest = train_dataset
        .examples()
        .iter()
        .chain(eval_dataset.examples())
        .map(|ex| ex.max_len())
        .max()
        .unwrap_or(1);
    let (model, varmap, cfg) = match &args.init_checkpoint {
        Some(dir) => {
            let (model, varmap) = PooledRewardModel::from_pretrained(dir, &device)
                .with_context(|| format!("Unable to load checkpoint {}", dir.display()))?;
            let cfg = *model.cfg();
            anyhow::ensure!(
                cfg.vocab_size >= tokenizer.vocab_size(),
                "checkpoint vocab size {} is smaller than the tokenizer's {}",
                cfg.vocab_size,
                tokenizer.vocab_size()
            );
            anyhow::ensure!(
                cfg.context_length >= longest,
                "checkpoint context length {} is shorter than the longest example ({longest})",
                cfg.context_length
            );
            (model, varmap, cfg)
        }
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let mut cfg = RewardModelConfig::small(tokenizer.vocab_size());
            cfg.context_length = training_args.max_length.unwrap_or(longest).max(1);
            if let Some(multiple) = args.pad_to_multiple_of.filter(|m| *m > 0) {
                cfg.context_length = cfg.context_length.div_ceil(multiple) * multiple;
            }
            let model = PooledRewardModel::new(cfg, vb.pp("model"))?;
            (model, varmap, cfg)
        }
    };

    // trainer
    let collator = ZeroPadRewardCollator::new(
        RewardDataCollatorWithPadding::new(tokenizer.pad_token_id())
            .pad_to_multiple_of(args.pad_to_multiple_of)
            .device(device.clone()),
    );
    let output_dir = training_args.output_dir.clone();
    let mut trainer = RewardTrainer::new(
        model,
        varmap,
        training_args,
        train_dataset,
        Some(eval_dataset),
        collator,
    )?
    .with_model_config(&cfg)?;

    trainer.train()?;
    trainer.save_model(&output_dir)?;
    let metrics = trainer.evaluate()?;
    trainer.log_metrics("eval", &metrics);
    println!("{metrics:?}");

    Ok(())
}

fn prepare_tldr(args: PrepareTldrArgs) -> anyhow::Result<()> {
    let comparisons = tldr::load_splits::<Comparison, _>(&args.comparisons_dir)
        .with_context(|| format!("Unable to read {}", args.comparisons_dir.display()))?;
    let preference = tldr::prepare_preference_splits(comparisons, args.debug)?;
    let preference_dir = args.output_dir.join("preference");
    tldr::write_splits(&preference, &preference_dir)?;
    println!("Saved preference splits to {:?}", preference_dir);

    if let Some(sft_dir) = &args.sft_dir {
        let records = tldr::load_splits::<SftRecord, _>(sft_dir)
            .with_context(|| format!("Unable to read {}", sft_dir.display()))?;
        let sft = tldr::prepare_sft_splits(records, args.debug);
        let sft_out = args.output_dir.join("sft");
        tldr::write_splits(&sft, &sft_out)?;
        println!("Saved SFT splits to {:?}", sft_out);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::PrepareTldr(args) => prepare_tldr(args),
    }
}
