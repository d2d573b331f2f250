use std::path::PathBuf;

use clap::Parser;

/// Writes a constant-bandwidth link trace, one delivery timestamp (ms) per line
#[derive(Parser, Debug)]
#[command(name = "ccpilot-gen-trace")]
struct Args {
    /// Constant bandwidth in Mbps
    #[arg(long, value_name = "Mbps")]
    bandwidth: f64,

    /// Directory to write the trace into
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    match ccpilot::trace::generate(args.bandwidth, &args.output_dir) {
        Ok(path) => println!("{}", path.display()),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
