use image_relocator::cli::{Args, Runner};
use image_relocator::logging::{Logger, init_tracing};
use std::process;

#[tokio::main]
async fn main() {
    let args = Args::parse_args();
    init_tracing(args.global.verbose);

    let runner = match Runner::new(args) {
        Ok(runner) => runner,
        Err(e) => {
            Logger::new(false).error(&e.to_string());
            process::exit(2);
        }
    };

    if let Err(e) = runner.run().await {
        runner.output().error(&e.to_string());
        process::exit(1);
    }
}
