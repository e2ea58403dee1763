extern crate fit_alloc;
#[macro_use]
extern crate quicli;
extern crate request_script;

use quicli::prelude::*;
use std::error;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use fit_alloc::{RbDupTree, RbParentTree, RbStackTree, RbTopDownTree, SegregatedList};
use request_script::{parse, run_script, Request};

/// Run allocator request scripts against the fit_alloc index variants,
/// validating every heap invariant after every request.
///
/// Exits nonzero on the first failing script.
#[derive(Debug, StructOpt)]
struct Cli {
    /// Free index to exercise: sl, rb-p, rb-d, rb-s, rb-t, or all.
    #[structopt(short = "i", long = "index", default_value = "all")]
    index: String,

    /// Heap size in bytes for each run.
    #[structopt(short = "s", long = "heap-size", default_value = "1048576")]
    heap_size: usize,

    /// The request scripts to run.
    #[structopt(parse(from_os_str))]
    scripts: Vec<PathBuf>,
}

const VARIANTS: &'static [&'static str] = &["sl", "rb-p", "rb-d", "rb-s", "rb-t"];

#[derive(Debug)]
struct HarnessError(String);

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for HarnessError {}

fn run_variant(variant: &str, requests: &[Request], heap_size: usize) -> Result<()> {
    let outcome = match variant {
        "sl" => run_script::<SegregatedList, _>(requests, heap_size, true, |_, _| {}),
        "rb-p" => run_script::<RbParentTree, _>(requests, heap_size, true, |_, _| {}),
        "rb-d" => run_script::<RbDupTree, _>(requests, heap_size, true, |_, _| {}),
        "rb-s" => run_script::<RbStackTree, _>(requests, heap_size, true, |_, _| {}),
        "rb-t" => run_script::<RbTopDownTree, _>(requests, heap_size, true, |_, _| {}),
        other => {
            return Err(HarnessError(format!("unknown index variant '{}'", other)).into());
        }
    }?;
    println!(
        "    {}: {} requests ok, {} bytes free at exit",
        variant, outcome.requests, outcome.final_capacity
    );
    Ok(())
}

main!(|cli: Cli| {
    if cli.scripts.is_empty() {
        Err(HarnessError("no scripts given".to_string()))?;
    }
    let variants: Vec<&str> = if cli.index == "all" {
        VARIANTS.to_vec()
    } else {
        vec![cli.index.as_str()]
    };
    for path in &cli.scripts {
        println!("{}", path.display());
        let text = fs::read_to_string(path)?;
        let requests = parse(&text)?;
        for variant in &variants {
            run_variant(variant, &requests, cli.heap_size)?;
        }
    }
    println!("all scripts ok");
});
