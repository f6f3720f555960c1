//! `otama-cli`: a thin command-line front end over the
//! `otama::facade::Handle` API, for operational use against a running
//! master relation (insert/search/pull/vacuum from a shell) rather than
//! as an embedding API. Gated behind the `cli` Cargo feature so the core
//! library stays free of `clap`/`env_logger` for library consumers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use otama::{Handle, Query};

#[derive(Parser)]
#[command(name = "otama-cli", about = "otama indexing/retrieval CLI")]
struct Opt {
    /// Path to the driver's YAML configuration file.
    #[arg(long, short = 'c')]
    config: PathBuf,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Insert an image file, printing its assigned hex id.
    Insert {
        file: PathBuf,
    },
    /// Search for the top-n most similar images to a file.
    Search {
        file: PathBuf,
        #[arg(long, short = 'n', default_value_t = 10)]
        n: usize,
    },
    /// Remove an image by its hex id.
    Remove {
        id: String,
    },
    /// Reconcile the local index against the master relation.
    Pull,
    /// Compact the local storage backend, reclaiming removed entries.
    Vacuum,
    /// Report the number of rows in the local index.
    Count,
}

fn main() -> ExitCode {
    env_logger::init();
    let opt = Opt::parse();
    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("otama-cli: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(opt: Opt) -> otama::Result<()> {
    let handle = Handle::open_path(&opt.config)?;
    match opt.subcmd {
        SubCommand::Insert { file } => {
            let id = handle.insert(&Query::file(file))?;
            println!("{}", id);
        }
        SubCommand::Search { file, n } => {
            let hits = handle.search_file(n, file)?;
            for hit in hits {
                println!("{}\t{:.6}", hit.id, hit.similarity);
            }
        }
        SubCommand::Remove { id } => {
            let id = otama::Id::from_hex(&id)?;
            handle.remove(&id)?;
        }
        SubCommand::Pull => {
            let (last_no, last_commit_no) = handle.pull()?;
            println!("last_no={} last_commit_no={}", last_no, last_commit_no);
        }
        SubCommand::Vacuum => {
            let reclaimed = handle.vacuum_index()?;
            println!("reclaimed={}", reclaimed);
        }
        SubCommand::Count => {
            println!("{}", handle.count()?);
        }
    }
    Ok(())
}
