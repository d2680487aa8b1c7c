//! Crescent CLI: load a Moondream 2 model directory and report it
//!
//! Takes one positional argument, a directory holding the text model and
//! multimodal projector weight files, loads the text backbone, and prints
//! the hyperparameter report. Exits 0 on a clean load, 1 on any argument
//! or load error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use crescent::Model;

const TEXT_MODEL_FNAME: &str = "moondream2-text-model-f16.gguf";
const MMPROJ_FNAME: &str = "moondream2-mmproj-f16.gguf";

/// Phi-2 inference core for Moondream 2
#[derive(Parser)]
#[command(name = "crescent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory containing the Moondream 2 weight files
    data_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let text_model_path = cli.data_dir.join(TEXT_MODEL_FNAME);
    let mmproj_path = cli.data_dir.join(MMPROJ_FNAME);
    println!("text model path: {}", text_model_path.display());
    println!("mmproj path: {}", mmproj_path.display());

    if !mmproj_path.is_file() {
        eprintln!("missing multimodal projector: {}", mmproj_path.display());
        return ExitCode::FAILURE;
    }

    let model = match Model::load(&text_model_path) {
        Ok(model) => model,
        Err(err) => {
            eprintln!("could not load model: {err}");
            return ExitCode::FAILURE;
        }
    };

    let hp = &model.hparams;
    println!("loaded {} from {}", model.name, text_model_path.display());
    println!("gguf version: {}", model.gguf.header.version);
    println!("gguf alignment: {}", model.gguf.alignment());
    println!("gguf data offset: {}", model.gguf.data_offset());
    println!("context length: {}", hp.n_ctx_train);
    println!("embedding length: {}", hp.n_embd);
    println!("block count: {}", hp.n_layer);
    println!("feed forward length: {}", hp.n_ff);
    println!("head count: {}", hp.n_head);
    println!("head count kv: {}", hp.n_head_kv);
    println!("n_embd_head_k: {}", hp.n_embd_head_k);
    println!("n_embd_head_v: {}", hp.n_embd_head_v);
    println!("vocab size: {}", model.n_vocab);

    ExitCode::SUCCESS
}
