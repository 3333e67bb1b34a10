fn main() {
    if let Err(err) = event_schema::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
