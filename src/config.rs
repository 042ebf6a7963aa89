#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "3000")]
    pub port: u16,

    // origin site the relay fronts - used for the spoofed Referer/Origin header
    // bundle on every upstream request, origins reject fetches without it
    #[clap(long, env, default_value = "https://appx-play.akamai.net.in")]
    pub upstream_origin: String,

    // per-request upstream timeout, playlists and segments share it
    #[clap(long, env, default_value = "60")]
    pub upstream_timeout_secs: u64,

    // redirect hop limit for upstream fetches
    #[clap(long, env, default_value = "5")]
    pub upstream_max_redirects: usize,

    // how many segment fetches the downloader keeps in flight at once
    #[clap(long, env, default_value = "5")]
    pub download_concurrency: usize,

    // attempts per segment before the download session is failed
    #[clap(long, env, default_value = "3")]
    pub download_retry_budget: u32,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 3000,
            upstream_origin: "https://appx-play.akamai.net.in".to_string(),
            upstream_timeout_secs: 60,
            upstream_max_redirects: 5,
            download_concurrency: 5,
            download_retry_budget: 3,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
        }
    }
}
