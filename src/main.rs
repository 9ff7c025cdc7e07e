use stampede::prelude::*;

// Runs the built-in iteration: one GET of `--path` followed by a pause.
fn main() {
    let result = Stampede::initialize()
        .map(|stampede| stampede.register_iteration(iteration!(http_get)))
        .and_then(|stampede| stampede.execute());

    match result {
        Ok(metrics) => metrics.print(),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
