//! `dna` binary entry point.

fn main() -> anyhow::Result<()> {
    dna_cli::run_main()
}
