use pg_warden::app;
use pg_warden::config;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();

    // Config parsing needs a runtime of its own; the server builds the
    // real multi-worker runtime afterwards.
    let config_result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(config::parse(&args.config_file));

    match config_result {
        Ok(()) => (),
        Err(err) => {
            eprintln!("Config parse error: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        println!("Config {} is OK", args.config_file);
        std::process::exit(exitcode::OK);
    }

    let config = config::get_config();
    app::init_logging(&args, &config);

    match app::run_server(args, config) {
        Ok(()) => (),
        Err(err) => {
            eprintln!("Server error: {err}");
            std::process::exit(exitcode::SOFTWARE);
        }
    };
}
