fn main() {
    if let Err(e) = antigravity_gateway_lib::run() {
        eprintln!("antigravity-gateway: {:#}", e);
        std::process::exit(1);
    }
}
