use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use structopt::StructOpt;

use polyscft::attribs::AttribSet;
use polyscft::catalog;
use polyscft::domain::{Domain, RunOverrides};
use polyscft::error::{classify, ErrorClass};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, StructOpt)]
#[structopt(
    name = "polyscft",
    about = "Polymer self-consistent field theory engine",
    setting = structopt::clap::AppSettings::DisableHelpFlags,
    setting = structopt::clap::AppSettings::DisableVersion
)]
struct Options {
    /// Print usage and exit.
    #[structopt(long = "help")]
    usage: bool,

    /// Input file path.
    #[structopt(short = "i", long = "input")]
    input: Option<String>,

    /// Output file base name.
    #[structopt(short = "o", long = "output")]
    output: Option<String>,

    /// Override the number of outer steps.
    #[structopt(short = "n", long = "nsteps")]
    nsteps: Option<usize>,

    /// Override the dump periodicity.
    #[structopt(short = "d", long = "dump-periodicity")]
    dump_periodicity: Option<usize>,

    /// Restart from the given dump sequence number.
    #[structopt(short = "r", long = "restart")]
    restart: Option<usize>,

    /// Print the version and exit.
    #[structopt(short = "v", long = "version")]
    version: bool,

    /// Print help for an object type and exit.
    #[structopt(short = "h", long = "object-help")]
    object_help: Option<String>,

    /// Parse and build the input, then exit without stepping.
    #[structopt(long = "validate")]
    validate: bool,

    /// Run in single precision instead of double.
    #[structopt(long = "single")]
    single: bool,
}

fn run(options: &Options) -> Result<()> {
    let input_path = options.input.as_deref().ok_or_else(|| {
        polyscft::error::class_error(
            ErrorClass::InvalidAttribute,
            "polyscft",
            "an input file is required (-i <file>)",
        )
    })?;
    let text = fs::read_to_string(input_path)
        .map_err(|e| {
            polyscft::error::class_error(ErrorClass::IoError, input_path, e)
        })
        .context("reading input file")?;
    let tas = AttribSet::from_json_str("Domain", &text)?;

    let overrides = RunOverrides {
        nsteps: options.nsteps,
        dump_periodicity: options.dump_periodicity,
        restart_seq: options.restart,
        output_base: options.output.clone(),
    };

    if options.single {
        let mut domain = Domain::<f32>::build(&tas, &overrides)?;
        if options.validate {
            info!("input validated: {}", domain.name());
            return Ok(());
        }
        domain.run()
    } else {
        let mut domain = Domain::<f64>::build(&tas, &overrides)?;
        if options.validate {
            info!("input validated: {}", domain.name());
            return Ok(());
        }
        domain.run()
    }
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let options = Options::from_args();

    if options.usage {
        Options::clap().print_long_help().ok();
        println!();
        return ExitCode::SUCCESS;
    }
    if options.version {
        println!("polyscft {VERSION}");
        return ExitCode::SUCCESS;
    }
    if let Some(tag) = &options.object_help {
        return match catalog::help_text(Some(tag)) {
            Some(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("unknown object type {tag:?}; known types:");
                if let Some(all) = catalog::help_text(None) {
                    eprintln!("{all}");
                }
                ExitCode::from(1)
            }
        };
    }

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // One line: class, object, context.
            error!("{err:#}");
            eprintln!("{err:#}");
            let code = classify(&err)
                .map(ErrorClass::exit_code)
                .unwrap_or(2);
            ExitCode::from(code as u8)
        }
    }
}
