use std::path::PathBuf;

use clap::Parser;

/// Process configuration, bound to flags and environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "health-aggregator",
    about = "Calls /__/health for services that expose the endpoint and aggregates the responses",
    version
)]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8080, help = "Port to listen on")]
    pub port: u16,

    #[arg(
        long,
        env = "OPS_PORT",
        default_value_t = 8081,
        help = "The HTTP ops port"
    )]
    pub ops_port: u16,

    #[arg(
        long,
        env = "HTTP_READ_TIMEOUT",
        default_value_t = 15,
        help = "The read timeout in seconds for HTTP connections"
    )]
    pub read_timeout: u64,

    #[arg(
        long,
        env = "HTTP_WRITE_TIMEOUT",
        default_value_t = 15,
        help = "The write timeout in seconds for HTTP connections"
    )]
    pub write_timeout: u64,

    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "INFO",
        help = "Log level (e.g. INFO, DEBUG, WARN)"
    )]
    pub log_level: String,

    #[arg(
        long,
        env = "MONGO_CONNECTION_STRING",
        default_value = "mongodb://127.0.0.1:27017",
        help = "Connection string used to connect to mongo"
    )]
    pub mongo_connection_string: String,

    #[arg(
        long,
        env = "MONGO_DROP_DB",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Set to true in order to drop the DB on startup"
    )]
    pub mongo_drop_db: bool,

    #[arg(
        long,
        env = "DELETE_CHECKS_AFTER_DAYS",
        default_value_t = 1,
        help = "Age of check results in days after which they are deleted"
    )]
    pub delete_checks_after_days: i64,

    #[arg(
        long = "restrict-namespace",
        env = "RESTRICT_NAMESPACE",
        value_delimiter = ',',
        help = "Restrict checks to one or more namespaces (empty for all)"
    )]
    pub restrict_namespaces: Vec<String>,

    #[arg(
        long,
        env = "KUBECONFIG_FILEPATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the kubeconfig file (defaults to in-cluster config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "STATUSPAGE_BASE_URL",
        default_value = "https://api.statuspage.io/v1",
        help = "Base URL of the statuspage.io API"
    )]
    pub statuspage_base_url: String,

    #[arg(
        long,
        env = "STATUSPAGE_PAGE_ID",
        help = "statuspage.io page id; component updates are disabled when unset"
    )]
    pub statuspage_page_id: Option<String>,

    #[arg(
        long,
        env = "STATUSPAGE_API_KEY",
        help = "statuspage.io API key; component updates are disabled when unset"
    )]
    pub statuspage_api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::parse_from(["health-aggregator"]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.ops_port, 8081);
        assert_eq!(config.read_timeout, 15);
        assert_eq!(config.write_timeout, 15);
        assert_eq!(config.log_level, "INFO");
        assert!(!config.mongo_drop_db);
        assert_eq!(config.delete_checks_after_days, 1);
        assert!(config.restrict_namespaces.is_empty());
        assert!(config.kubeconfig.is_none());
        assert!(config.statuspage_page_id.is_none());
    }

    #[test]
    fn restrict_namespaces_accepts_a_comma_separated_list() {
        let config = Config::parse_from([
            "health-aggregator",
            "--restrict-namespace",
            "auth,redis",
            "--restrict-namespace",
            "energy",
        ]);
        assert_eq!(config.restrict_namespaces, vec!["auth", "redis", "energy"]);
    }

    #[test]
    fn drop_db_flag_takes_an_explicit_value() {
        let config = Config::parse_from(["health-aggregator", "--mongo-drop-db", "true"]);
        assert!(config.mongo_drop_db);
    }
}
