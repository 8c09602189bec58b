use clap::Parser;
use ptconv_cli::{init_logging, Args, ConvertApp};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let app = ConvertApp::new(args.file);
    app.run(&mut std::io::stdout().lock())?;
    Ok(())
}
