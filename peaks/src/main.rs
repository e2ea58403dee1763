extern crate fit_alloc;
#[macro_use]
extern crate quicli;
extern crate request_script;

use quicli::prelude::*;
use std::error;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use fit_alloc::{
    FreeIndex, RbDupTree, RbParentTree, RbStackTree, RbTopDownTree, SegregatedList, Verbosity,
};
use request_script::{parse, run_script, Request};

/// Run one request script and pretty-print the linear heap and the free
/// index, at the end of the run and at any breakpoint request indexes.
#[derive(Debug, StructOpt)]
struct Cli {
    /// Free index to print: sl, rb-p, rb-d, rb-s, or rb-t.
    #[structopt(short = "i", long = "index", default_value = "rb-d")]
    index: String,

    /// Show raw addresses alongside offsets and sizes.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Also print the heap after these request indexes (repeatable).
    #[structopt(short = "b", long = "breakpoint")]
    breakpoints: Vec<usize>,

    /// Heap size in bytes.
    #[structopt(short = "s", long = "heap-size", default_value = "1048576")]
    heap_size: usize,

    /// The request script to run.
    #[structopt(parse(from_os_str))]
    script: PathBuf,
}

#[derive(Debug)]
struct HarnessError(String);

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for HarnessError {}

fn show<I: FreeIndex>(
    requests: &[Request],
    heap_bytes: usize,
    verbosity: Verbosity,
    breakpoints: &[usize],
) -> Result<()> {
    let last = requests.len().wrapping_sub(1);
    let outcome = run_script::<I, _>(requests, heap_bytes, true, |i, heap| {
        if breakpoints.contains(&i) {
            println!("-- after request {} --", i);
            println!("{}", heap.dump(verbosity));
        }
        if i == last {
            println!("-- final --");
            println!("{}", heap.dump(verbosity));
        }
    })?;
    println!(
        "{} requests, {} bytes free at exit",
        outcome.requests, outcome.final_capacity
    );
    Ok(())
}

main!(|cli: Cli| {
    let text = fs::read_to_string(&cli.script)?;
    let requests = parse(&text)?;
    let verbosity = if cli.verbose {
        Verbosity::Addresses
    } else {
        Verbosity::Sizes
    };
    match cli.index.as_str() {
        "sl" => show::<SegregatedList>(&requests, cli.heap_size, verbosity, &cli.breakpoints)?,
        "rb-p" => show::<RbParentTree>(&requests, cli.heap_size, verbosity, &cli.breakpoints)?,
        "rb-d" => show::<RbDupTree>(&requests, cli.heap_size, verbosity, &cli.breakpoints)?,
        "rb-s" => show::<RbStackTree>(&requests, cli.heap_size, verbosity, &cli.breakpoints)?,
        "rb-t" => show::<RbTopDownTree>(&requests, cli.heap_size, verbosity, &cli.breakpoints)?,
        other => Err(HarnessError(format!("unknown index variant '{}'", other)))?,
    }
});
