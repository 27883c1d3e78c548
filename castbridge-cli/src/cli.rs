use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Serve upstream radio channels as ICY/HTTP streams",
    long_about = "Logs into the upstream radio service, and serves every channel of the\n\
                  lineup as a plain AAC stream that internet-radio players can open.\n\
                  \n\
                  Channels start when their first listener connects and stop once\n\
                  nobody has listened for the grace period."
)]
pub struct CliArgs {
    /// Configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "TOML configuration file (default: ./castbridge.toml when present)"
    )]
    pub config: Option<PathBuf>,

    /// Host name advertised in stream URLs
    #[arg(long, help = "Host name used in stream and icy-url links")]
    pub hostname: Option<String>,

    /// Listen port
    #[arg(short, long, help = "TCP port listeners connect to")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long, value_name = "ADDR", help = "Address the server binds to")]
    pub bind: Option<String>,

    /// Upstream account user name
    #[arg(long, env = "CASTBRIDGE_USERNAME", help = "Upstream account user name")]
    pub username: Option<String>,

    /// Upstream account password
    #[arg(
        long,
        env = "CASTBRIDGE_PASSWORD",
        hide_env_values = true,
        help = "Upstream account password"
    )]
    pub password: Option<String>,

    /// Print the channel lineup and exit
    #[arg(short, long, help = "Print the channel lineup with stream URLs and exit")]
    pub list: bool,

    /// Log file
    #[arg(
        long,
        default_value = "castbridge.log",
        help = "File the log is written to besides stdout, truncated on start"
    )]
    pub log_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging", conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, help = "Only log warnings and errors")]
    pub quiet: bool,
}
