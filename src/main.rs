use stampede::prelude::*;

fn main() {
    match Stampede::initialize().and_then(|stampede| stampede.execute()) {
        Ok(metrics) => metrics.print(),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
