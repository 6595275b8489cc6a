use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use taco_eval::dataset::TacoDataset;
use taco_eval::download::{DownloadConfig, Downloader, TacoDownloader};
use taco_eval::evaluate::{Evaluator, MatchOptions, MatchStrategy};

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Strategy {
    AllPairs,
    GreedyOneToOne,
}

impl From<Strategy> for MatchStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::AllPairs => MatchStrategy::AllPairs,
            Strategy::GreedyOneToOne => MatchStrategy::GreedyOneToOne,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "whether to enable verbose mode")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// download the images listed by a TACO repository checkout
    Download {
        #[arg(long, help = "path to the TACO repository checkout")]
        repo: PathBuf,

        #[arg(long, help = "directory to download images into, must exist")]
        download_dir: PathBuf,

        #[arg(long, help = "download original uploads instead of 640px renditions")]
        full_resolution: bool,

        #[arg(long, default_value_t = 4, help = "number of concurrent downloads")]
        workers: usize,

        #[arg(long, default_value_t = 8192, help = "buffer size used while streaming")]
        chunk_size: usize,
    },
    /// print categories and sample counts of an annotation file
    Summary {
        #[arg(long, help = "path to annotations.json")]
        annotations: PathBuf,

        #[arg(long, help = "cap on the number of annotations processed")]
        sample_count: Option<usize>,
    },
    /// evaluate stored predictions against ground truth
    Evaluate {
        #[arg(long, help = "path to annotations.json")]
        annotations: PathBuf,

        #[arg(long, help = "directory holding the downloaded images")]
        images: PathBuf,

        #[arg(long, help = "directory holding {prompt}.json prediction files")]
        results_dir: PathBuf,

        #[arg(long = "prompt", required = true, help = "prompt name to evaluate, repeatable")]
        prompts: Vec<String>,

        #[arg(long, help = "cap on the number of annotations processed")]
        sample_count: Option<usize>,

        #[arg(
            long,
            default_value_t = 0.5,
            help = "a value between 0.0 and 1.0, minimum IoU for a match"
        )]
        iou_threshold: f32,

        #[arg(long, value_enum, default_value_t = Strategy::AllPairs)]
        strategy: Strategy,

        #[arg(long, help = "write the confusion matrices to this json file")]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let env = Env::new().filter_or("TACO_EVAL_LOG", if args.verbose { "debug" } else { "info" });
    env_logger::init_from_env(env);
    debug!("{:?}", args);

    match args.command {
        Command::Download {
            repo,
            download_dir,
            full_resolution,
            workers,
            chunk_size,
        } => {
            anyhow::ensure!(workers > 0, "workers must be > 0");
            let taco = TacoDownloader::new(repo, download_dir, full_resolution);
            anyhow::ensure!(
                taco.check_params(),
                "repository {:?} must be a non-empty directory and {:?} must exist",
                taco.repo_path,
                taco.download_dir
            );
            let downloader = Downloader::new(DownloadConfig {
                workers,
                chunk_size,
            });
            let report = taco.download_images(&downloader)?;
            info!(
                "{} downloaded, {} failed, {} skipped",
                report.successful.len(),
                report.failed.len(),
                report.skipped
            );
        }
        Command::Summary {
            annotations,
            sample_count,
        } => {
            let dataset = TacoDataset::new(&annotations, ".", sample_count)?;
            println!("images listed:    {}", dataset.image_file_names().len());
            println!("images annotated: {}", dataset.len());
            println!("categories:       {}", dataset.categories().len());
            println!("supercategories:  {}", dataset.supercategories().join(", "));
        }
        Command::Evaluate {
            annotations,
            images,
            results_dir,
            prompts,
            sample_count,
            iou_threshold,
            strategy,
            output,
        } => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&iou_threshold),
                "iou-threshold must be between 0.0 and 1.0"
            );
            let dataset = TacoDataset::new(&annotations, &images, sample_count)?;
            let evaluator = Evaluator::new(&dataset, &results_dir).with_options(MatchOptions {
                iou_threshold,
                strategy: strategy.into(),
            });

            let mut evaluations = serde_json::Map::new();
            for prompt in &prompts {
                let now = Instant::now();
                let evaluation = evaluator.evaluate(prompt)?;
                info!(
                    "evaluating {} took {:.3}s",
                    prompt,
                    now.elapsed().as_secs_f32()
                );
                if evaluation.confusion.is_empty() {
                    warn!("no box matched for prompt {}", prompt);
                }
                println!("== {prompt}");
                println!(
                    "matches: {}, matching phrases: {}",
                    evaluation.confusion.total(),
                    evaluation.matching_phrases
                );
                for (gt, pred, count) in evaluation.confusion.iter() {
                    println!("{gt}\t{pred}\t{count}");
                }
                evaluations.insert(prompt.clone(), serde_json::to_value(&evaluation)?);
            }

            if let Some(output) = output {
                let mut buf_writer = BufWriter::new(File::create(&output)?);
                serde_json::to_writer_pretty(&mut buf_writer, &evaluations)?;
                writeln!(&mut buf_writer)?;
                buf_writer.flush()?;
                info!("evaluation json file {:?} generated", output);
            }
        }
    }

    Ok(())
}
