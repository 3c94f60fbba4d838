use clap::Parser;

use postpilot::vault::Vault;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generate a random vault key (hex) for the configured key env var"
)]
struct Args {
    /// Env var name to print in the export line
    #[arg(long, default_value = "POSTPILOT_VAULT_KEY")]
    env: String,
}

fn main() {
    let args = Args::parse();
    println!("export {}={}", args.env, Vault::generate_key_hex());
}
