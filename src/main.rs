// src/main.rs - `train` and `generate` commands
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::seq::SliceRandom;
use tch::{nn, nn::OptimizerConfig, Device};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qgen::config::{ConditionSource, ModelConfig, OutputBlend, TrainConfig};
use qgen::data_loader::{tokenize, DataLoader, Example};
use qgen::metrics::{bleu, rouge_1, ScoreSummary};
use qgen::model::QgModel;
use qgen::training::{generate_questions, Trainer, BEST_CHECKPOINT};
use qgen::vocab::{load_glove, Vocab};

const MODEL_CONFIG_FILE: &str = "model_config.json";
const VOCAB_FILE: &str = "vocab.json";
const FINAL_CHECKPOINT: &str = "qgen_model.pt";

#[derive(Parser, Debug)]
#[command(
    name = "qgen",
    version,
    about = "Generate questions from a passage and an answer span inside it."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train on a CSV of (context, question, answer, answer_start) rows
    Train(TrainArgs),
    /// Beam-decode questions with a trained checkpoint
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "qg_train.csv")]
    data: PathBuf,

    /// Checkpoint, vocabulary and config output directory
    #[arg(long, default_value = "checkpoints")]
    out_dir: PathBuf,

    /// JSON model config; flags below override it
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// JSON training config; flags below override it
    #[arg(long)]
    train_config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    vocab_size: Option<usize>,

    #[arg(long)]
    max_copy_size: Option<usize>,

    /// Condition on the answer encoder's final state instead of the span mean
    #[arg(long)]
    answer_encoder: bool,

    /// Gate generation and copying with a learned switch
    #[arg(long)]
    switch: bool,

    /// Feed the condition vector into the vocabulary projection
    #[arg(long)]
    vocab_conditioning: bool,

    /// GloVe-format text vectors for the word embeddings
    #[arg(long)]
    glove: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long, default_value = "qg_test.csv")]
    data: PathBuf,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long)]
    beam_width: Option<usize>,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qgen=info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Generate(args) => run_generate(args),
    }
}

fn pick_device() -> Device {
    let device = if tch::Cuda::is_available() {
        info!("CUDA device detected");
        Device::Cuda(0)
    } else {
        info!("Using CPU");
        Device::Cpu
    };
    info!(cores = num_cpus::get(), "host threads available for preprocessing");
    device
}

fn run_train(args: TrainArgs) -> Result<()> {
    let device = pick_device();
    tch::manual_seed(args.seed as i64);

    let mut model_cfg = match &args.model_config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    if let Some(c) = args.max_copy_size {
        model_cfg.max_copy_size = c;
    }
    if args.answer_encoder {
        model_cfg.condition = ConditionSource::AnswerEncoder;
    }
    if args.switch {
        model_cfg.blend = OutputBlend::Switch;
    }
    model_cfg.vocab_conditioning |= args.vocab_conditioning;
    model_cfg.validate()?;

    let mut train_cfg = match &args.train_config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    if let Some(e) = args.epochs {
        train_cfg.epochs = e;
    }
    if let Some(b) = args.batch_size {
        train_cfg.batch_size = b;
    }
    if let Some(lr) = args.lr {
        train_cfg.learning_rate = lr;
    }
    if let Some(v) = args.vocab_size {
        train_cfg.vocab_size = v;
    }
    train_cfg.validate()?;

    let loader = DataLoader::new(&args.data)?;
    model_cfg.check_passages(loader.longest_passage())?;

    let (train_data, val_data) = loader.train_val_split(train_cfg.train_ratio, args.seed);
    info!(train = train_data.len(), validation = val_data.len(), "split data");

    // validation words stay out of the vocabulary
    let vocab = Vocab::fit_examples(&train_data, train_cfg.vocab_size);
    info!(size = vocab.len(), "built vocabulary");

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    vocab.save(args.out_dir.join(VOCAB_FILE))?;
    model_cfg.save(args.out_dir.join(MODEL_CONFIG_FILE))?;

    let mut vs = nn::VarStore::new(device);
    vs.set_kind(tch::Kind::Float);
    let model = QgModel::new(&vs.root(), vocab.len() as i64, &model_cfg);

    if let Some(path) = &args.glove {
        let vectors = load_glove(path, model_cfg.embedding_size as usize, &vocab)?;
        let written = model.load_pretrained(&vectors);
        info!(rows = written, "initialized embeddings from pretrained vectors");
    }

    let total_params: i64 = vs
        .trainable_variables()
        .iter()
        .map(|t| t.size().iter().product::<i64>())
        .sum();
    info!(total_params, ?model_cfg, "model initialized");

    let opt = nn::Adam::default().build(&vs, train_cfg.learning_rate)?;
    let epochs = train_cfg.epochs;
    let batch_size = train_cfg.batch_size;
    let mut trainer = Trainer::new(model, vs, opt, device, train_cfg);
    trainer.train(&train_data, &val_data, &vocab, epochs, &args.out_dir, args.seed)?;

    let final_path = args.out_dir.join(FINAL_CHECKPOINT);
    trainer.save_model(&final_path)?;
    info!(path = %final_path.display(), "model saved");

    let mut rng = rand::thread_rng();
    let samples: Vec<Example> = val_data.choose_multiple(&mut rng, 5).cloned().collect();
    report(trainer.model(), &samples, &vocab, batch_size, device)
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let device = pick_device();
    let dir = &args.checkpoint_dir;

    let mut model_cfg = ModelConfig::load(dir.join(MODEL_CONFIG_FILE))?;
    if let Some(w) = args.beam_width {
        model_cfg.beam_width = w;
    }
    model_cfg.validate()?;
    let vocab = Vocab::load(dir.join(VOCAB_FILE))?;

    let loader = DataLoader::new(&args.data)?;
    model_cfg.check_passages(loader.longest_passage())?;

    let mut vs = nn::VarStore::new(device);
    let model = QgModel::new(&vs.root(), vocab.len() as i64, &model_cfg);
    load_weights(&mut vs, dir)?;

    report(&model, loader.examples(), &vocab, args.batch_size, device)
}

/// Best checkpoint if present, else the final one.
fn load_weights(vs: &mut nn::VarStore, dir: &Path) -> Result<()> {
    let best = dir.join(BEST_CHECKPOINT);
    let path = if best.exists() {
        best
    } else {
        warn!("no {} in {}, using final weights", BEST_CHECKPOINT, dir.display());
        dir.join(FINAL_CHECKPOINT)
    };
    vs.load(&path)
        .with_context(|| format!("loading weights from {}", path.display()))?;
    info!(path = %path.display(), "loaded weights");
    Ok(())
}

fn report(model: &QgModel, examples: &[Example], vocab: &Vocab, batch_size: usize, device: Device) -> Result<()> {
    let questions = generate_questions(model, examples, vocab, batch_size, device)?;
    let mut summary = ScoreSummary::default();

    for (i, (ex, generated)) in examples.iter().zip(&questions).enumerate() {
        let candidate = tokenize(generated);
        let b = bleu(&ex.question, &candidate);
        let r = rouge_1(&ex.question, &candidate);
        summary.add(&ex.question, &candidate);

        println!("\n--- Sample {} ---", i + 1);
        println!("Context:   {}", ex.context.join(" "));
        println!("Answer:    {}", ex.answer.join(" "));
        println!("Reference: {}", ex.question.join(" "));
        println!("Generated: {}", generated);
        println!(
            "BLEU-1: {:.4}  BLEU-4: {:.4}  ROUGE-1 F1: {:.3}",
            b.precisions[0], b.bleu, r.f1
        );
    }

    let (mean_bleu, mean_rouge) = summary.means();
    println!("\n{}", "=".repeat(50));
    println!("Questions:       {}", summary.count());
    println!("Average BLEU:    {:.4}", mean_bleu);
    println!("Average ROUGE-1: {:.4}", mean_rouge);
    println!("{}", "=".repeat(50));
    Ok(())
}
