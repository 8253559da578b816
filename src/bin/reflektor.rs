//! CLI front-end: load an image off disk and invoke one export.

use std::process::ExitCode;

use clap::Parser;
use reflektor::Image;

#[derive(Parser)]
#[command(name = "reflektor", about = "In-memory loader for native shared-library images")]
struct Args {
    /// Path to the ELF, Mach-O, or PE image to load.
    path: std::path::PathBuf,

    /// Exported, zero-argument symbol to invoke after loading.
    #[arg(long, default_value = "StartW")]
    call_export: String,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> reflektor::Result<()> {
    let image = Image::load_from_path(&args.path)?;
    image.call_export(&args.call_export)
}
