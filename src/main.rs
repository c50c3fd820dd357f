use vigil::core::terminal;

#[tokio::main]
async fn main() {
    if let Err(e) = vigil::cli::run_main().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
