// ========================================================================================
//
//                            THE XMLTALLY ORCHESTRATOR
//
// ========================================================================================
//
// A thin conductor over the library: parse arguments, configure logging, run the
// bounded streaming pipeline over the input file with the built-in element counter,
// and report the summary. All coordination logic lives in `pipeline`; this binary
// only owns the process lifecycle.

use clap::Parser;
use std::path::PathBuf;
use std::process;
use xmltally::{count_graph_elements, process_file, PipelineConfig};

#[derive(Parser, Debug)]
#[clap(
    name = "xmltally",
    version,
    about = "Streaming statistics over very large XML record files."
)]
struct Args {
    /// Path to the input XML document.
    input: PathBuf,

    /// Element name that delimits one record.
    #[clap(long, default_value = "resnet")]
    tag: String,

    /// Worker threads; 0 means one per logical CPU.
    #[clap(long, default_value_t = 0)]
    threads: usize,

    /// Fragments read between progress log lines.
    #[clap(long = "progress-every", default_value_t = 5000)]
    progress_every: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let defaults = PipelineConfig::default();
    let config = PipelineConfig {
        tag_name: args.tag,
        pool_size: if args.threads == 0 {
            defaults.pool_size
        } else {
            args.threads
        },
        progress_cadence: args.progress_every,
        ..defaults
    };

    match process_file(&args.input, &count_graph_elements, &config) {
        Ok(summary) => {
            println!(
                "{} fragments read, {} succeeded, {} failed in {:.2?}",
                summary.fragments_read, summary.succeeded, summary.failed, summary.elapsed
            );
            println!("{}", summary.counts);
            // A best-effort batch job: per-record failures are reported above but
            // do not fail the process.
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            let mut cause = std::error::Error::source(&e);
            while let Some(inner) = cause {
                eprintln!("  caused by: {inner}");
                cause = inner.source();
            }
            process::exit(1);
        }
    }
}
