use std::time::Duration;

use clap::Parser;
use crt_rt::{
    config::RuntimeConfig, CrtRuntime, LoaderReason, MappedImage, RuntimeError, StaticInitTable,
};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

fn hello() {
    tracing::info!("static constructor: hello");
}

fn goodbye() {
    tracing::info!("static destructor: goodbye");
}

static CTORS: [Option<fn()>; 2] = [Some(hello), None];
static DTORS: [Option<fn()>; 2] = [Some(goodbye), None];

fn farewell(n: usize) {
    tracing::info!("deferred exit callback #{}", n);
}

#[derive(clap::Parser, Clone, Debug)]
#[command(about = "Run a small program through the crt-rt runtime substrate")]
struct Cli {
    /// Status the entry point returns.
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
    /// Number of blocks to take from the runtime's pool.
    #[arg(long, default_value_t = 8)]
    blocks: usize,
    /// Number of deferred exit callbacks to register.
    #[arg(long, default_value_t = 3)]
    callbacks: usize,
    /// Panic inside the entry point.
    #[arg(long)]
    fault: bool,
    /// Sleep this many seconds before returning, so an interrupt can be sent.
    #[arg(long)]
    wait: Option<u64>,
    /// Install an interrupt response instead of using the default policy.
    #[arg(long)]
    ignore_interrupt: bool,
    /// List the sections of this program's own mapped image and exit.
    #[arg(long)]
    sections: bool,
}

fn main() -> miette::Result<()> {
    let config = RuntimeConfig::from_env();
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .without_time()
            .with_env_filter(EnvFilter::try_new(&config.log_filter).into_diagnostic()?)
            .finish(),
    )
    .into_diagnostic()?;

    let cli = Cli::try_parse().into_diagnostic()?;

    if cli.sections {
        return print_sections();
    }

    let rt = CrtRuntime::new(config, StaticInitTable::new(&CTORS, &DTORS));
    if let Err(e) = rt.notify(LoaderReason::ProcessAttach) {
        std::process::exit(rt.report_fatal(&e));
    }

    rt.start(|| match run(&rt, &cli) {
        Ok(()) => cli.exit_code,
        Err(e) => {
            tracing::error!("{:?}", miette::Report::new(e));
            1
        }
    })
}

fn run(rt: &CrtRuntime, cli: &Cli) -> Result<(), RuntimeError> {
    for n in 0..cli.callbacks {
        rt.register_at_exit(farewell, n)?;
    }

    let pool = rt.pool();
    let mut blocks = Vec::with_capacity(cli.blocks);
    for i in 0..cli.blocks {
        let mut block = pool.allocate()?;
        block.as_mut_slice()[0] = i as u8;
        blocks.push(block);
    }
    tracing::info!(
        "took {} blocks from an arena of {} slots",
        blocks.len(),
        rt.arena().capacity()
    );
    for block in blocks.drain(..) {
        pool.deallocate(block);
    }

    let spare = rt.pool();
    spare.splice(&pool);
    tracing::info!(
        "spliced {} free blocks into a second pool, {} left behind",
        spare.free_len(),
        pool.free_len()
    );

    if cli.ignore_interrupt {
        rt.router()
            .set_response(|| tracing::info!("interrupt received and ignored"));
    }

    if let Some(secs) = cli.wait {
        tracing::info!("waiting {}s for an interrupt", secs);
        std::thread::sleep(Duration::from_secs(secs));
    }

    if cli.fault {
        panic!("fault requested on the command line");
    }

    Ok(())
}

fn print_sections() -> miette::Result<()> {
    let image = MappedImage::current()?;
    println!("image base {:#x}", image.base());
    println!("{:<8} {:>10} {:>10} {:>10}  flags", "name", "rva", "size", "raw");
    for section in image.sections()? {
        println!(
            "{:<8} {:#10x} {:#10x} {:#10x}  {:?}",
            section.name().unwrap_or("?"),
            section.base.wrapping_sub(image.base()),
            section.size,
            section.raw_size,
            section.flags
        );
    }
    Ok(())
}
