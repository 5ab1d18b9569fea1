//! Node identity generator.
//!
//! Writes an ML-DSA-65 keypair and a VRF secret as JSON, and prints the public
//! halves:
//!   keygen --node-id eu-01 --region eu --out eu-01.json

use clap::Parser;
use pulsechain::{NodeId, NodeIdentity, Region};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Generate a PulseChain node identity")]
struct Args {
    #[arg(long)]
    node_id: String,

    #[arg(long)]
    region: String,

    /// Output file
    #[arg(short, long)]
    out: PathBuf,

    /// Replace an existing file
    #[arg(long)]
    force: bool,
}

fn main() {
    let args = Args::parse();

    if args.out.exists() && !args.force {
        eprintln!("error: {} exists. Refusing to overwrite without --force.", args.out.display());
        std::process::exit(2);
    }

    let identity = NodeIdentity::generate(NodeId::new(args.node_id), Region::new(args.region));
    if let Err(e) = identity.save(&args.out) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    println!("node_id={}", identity.node_id);
    println!("region={}", identity.region);
    println!("pubkey_hex={}", hex::encode(&identity.keypair.public));
    println!("vrf_pubkey_hex={}", hex::encode(identity.vrf.public_key()));
}
