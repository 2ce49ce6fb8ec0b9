use clap::Parser;

#[derive(Parser, Debug)]
pub struct Opts {
    #[clap(long, default_value = "config.yaml")]
    pub config: String,

    #[clap(long, default_value = "default")]
    pub namespace: String,

    // Build-ID allocator endpoint; GET {url}?job={job} returns a decimal body.
    #[clap(long)]
    pub tot_url: String,

    #[clap(long, default_value = "https://api.github.com")]
    pub github_endpoint: String,

    #[clap(long)]
    pub github_token: Option<String>,

    #[clap(long, default_value = "30")]
    pub sync_period_seconds: u64,

    // Capacity of the report channel between the controller and the
    // report-logging consumer.
    #[clap(long, default_value = "2048")]
    pub report_buffer: usize,
}
