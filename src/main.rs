fn main() {
    let code = match t2::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("t2 error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
