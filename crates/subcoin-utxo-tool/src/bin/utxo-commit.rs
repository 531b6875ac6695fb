fn main() {
    if let Err(err) = subcoin_utxo_tool::run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
