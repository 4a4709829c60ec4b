fn main() {
    if let Err(e) = nextdesk_lib::run() {
        tracing::error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
