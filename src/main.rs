#[tokio::main]
async fn main() {
    if let Err(e) = epic_session::run().await {
        log::error!("{e}");
        eprintln!("epic-session: {e}");
        std::process::exit(1);
    }
}
