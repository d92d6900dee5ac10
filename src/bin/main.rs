use subasta::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut config = config::Config::default();
            config::apply_env_overrides(&mut config);
            config
        }
    };

    telemetry::init(telemetry::TelemetryConfig::new(
        cli.verbose,
        config.logging.clone(),
    ));

    if let Err(e) = cli::run(cli, config) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}
