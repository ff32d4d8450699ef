//! Runs ISA conformance tests against the simulator entry point.
//!
//! ```bash
//! # every virtual-memory test
//! isa-harness -v
//!
//! # one test, logs to a custom directory
//! isa-harness -n rv64ui-p-add -o /tmp/isa_logs
//!
//! # convert test ELFs to flat binaries
//! isa-harness --gen_bin
//! ```

use std::process;
use std::time::Duration;

use clap::Parser;

use archsim::harness::{Harness, HarnessError, HarnessPaths, Selection};

#[derive(Parser, Debug)]
#[command(author, version, about = "ISA conformance test runner")]
struct Args {
    /// Name of the test
    #[arg(short, long)]
    name: Option<String>,

    /// Run all -v- tests
    #[arg(short = 'v', long = "virtual")]
    r#virtual: bool,

    /// Run all -p- tests
    #[arg(short, long)]
    physical: bool,

    /// Run all tests
    #[arg(short, long)]
    all: bool,

    /// Output directory, defaults to $PROJ_ROOT/isatest_logs
    #[arg(short, long)]
    output: Option<String>,

    /// Generate .bin images in the test directory and exit
    #[arg(long = "gen_bin")]
    gen_bin: bool,

    /// Wall-clock limit per test, in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn selection(&self) -> Result<Selection, HarnessError> {
        if let Some(name) = &self.name {
            Ok(Selection::Name(name.clone()))
        } else if self.r#virtual {
            Ok(Selection::Virtual)
        } else if self.physical {
            Ok(Selection::Physical)
        } else if self.all {
            Ok(Selection::All)
        } else {
            Err(HarnessError::NoSelection)
        }
    }
}

fn run(args: &Args) -> Result<bool, HarnessError> {
    let mut paths = HarnessPaths::from_env()?;
    if let Some(output) = &args.output {
        paths = paths.with_output(output);
    }
    let harness = Harness::new(paths).with_timeout(Duration::from_secs(args.timeout));

    if args.gen_bin {
        let converted = harness.gen_bin()?;
        println!("Generated {} test images", converted);
        return Ok(true);
    }

    let selection = args.selection()?;
    let summary = harness.run(&selection)?;
    summary.print();
    Ok(summary.all_passed())
}

fn main() {
    let args = Args::parse();
    archsim::init_logging(&args.log_level);

    match run(&args) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    }
}
