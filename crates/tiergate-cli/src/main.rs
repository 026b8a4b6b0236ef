fn main() {
    tiergate_cli::init_tracing();
    std::process::exit(tiergate_cli::run_main());
}
