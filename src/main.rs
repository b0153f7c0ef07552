fn main() {
    #[cfg(feature = "cli")]
    fotadelta::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("fotadelta: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
