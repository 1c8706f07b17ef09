//! CLI argument parsing for gpushare

use std::path::PathBuf;

use clap::Parser;

/// GPU share device plugin - advertises fractional GPUs and reports their health
#[derive(Debug, Parser)]
#[command(name = "gpushare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gpushare/config.yaml")]
    pub config: PathBuf,

    /// Virtual devices per physical GPU (overrides config; invalid values fall back to 5)
    #[arg(long, env = "GPU_SHARE_DEGREE")]
    pub share_degree: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GPUSHARE_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GPUSHARE_LOG_JSON")]
    pub log_json: bool,

    /// Print the advertised device list as JSON and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["gpushare"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/gpushare/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_custom_config() {
        let cli = Cli::try_parse_from(["gpushare", "-c", "/custom/config.yaml"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/custom/config.yaml");
    }

    #[test]
    fn test_cli_share_degree_is_raw() {
        let cli = Cli::try_parse_from(["gpushare", "--share-degree", "abc"]).unwrap();
        assert_eq!(cli.share_degree.as_deref(), Some("abc"));
    }
}
