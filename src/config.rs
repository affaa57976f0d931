use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gym Session - sign in and call the gym tracking API from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Gym API base URL
    #[arg(short = 'u', long, env = "GYM_API_URL", default_value = "http://localhost:3333")]
    pub api_url: String,

    /// Path to the session database
    #[arg(short = 'd', long, env = "GYM_AUTH_DB")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Upper bound for one token refresh call, in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "15")]
    pub refresh_timeout: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in and persist the session
    SignIn {
        #[arg(short, long)]
        email: String,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Create an account (does not sign in)
    SignUp {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Discard the local session
    SignOut,
    /// Show the signed-in user
    Whoami,
    /// GET an API path, e.g. /exercises/groups
    Get { path: String },
    /// POST a JSON body to an API path, e.g. /history
    Post {
        path: String,
        #[arg(long, default_value = "{}")]
        json: String,
    },
    /// Update name and/or password
    UpdateProfile {
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        old_password: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,

    // Storage
    pub db_file: PathBuf,

    // Timeouts
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub token_refresh_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let db_file = match args.db_file {
            Some(ref path) => expand_tilde(path),
            None => default_db_path().context(
                "Could not determine a data directory (use -d or set GYM_AUTH_DB)",
            )?,
        };

        Ok(Config {
            api_base_url: args.api_url.trim_end_matches('/').to_string(),
            db_file,
            http_request_timeout: args.http_timeout,
            http_connect_timeout: args.connect_timeout,
            token_refresh_timeout: args.refresh_timeout,
            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            anyhow::bail!(
                "GYM_API_URL must be an http(s) URL: {}",
                self.api_base_url
            );
        }

        if self.http_request_timeout == 0
            || self.http_connect_timeout == 0
            || self.token_refresh_timeout == 0
        {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        Ok(())
    }
}

/// Default session database location in the platform data directory
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("gym-session").join("auth.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            api_base_url: "http://localhost:3333".to_string(),
            db_file: PathBuf::from("/tmp/auth.sqlite3"),
            http_request_timeout: 30,
            http_connect_timeout: 10,
            token_refresh_timeout: 15,
            log_level: "warn".to_string(),
        }
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_cli_defaults() {
        let cli = Cli::try_parse_from(["gym-session", "-d", "/tmp/a.db", "whoami"]).unwrap();
        let config = Config::from_args(&cli.global).unwrap();

        assert_eq!(config.db_file, PathBuf::from("/tmp/a.db"));
        assert_eq!(config.token_refresh_timeout, 15);
        assert!(matches!(cli.command, Command::Whoami));
    }

    #[test]
    fn test_parse_sign_in() {
        let cli = Cli::try_parse_from([
            "gym-session",
            "--api-url",
            "https://api.example.com/",
            "-d",
            "~/gym/auth.sqlite3",
            "sign-in",
            "--email",
            "a@b.com",
        ])
        .unwrap();
        let config = Config::from_args(&cli.global).unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert!(config.db_file.ends_with("gym/auth.sqlite3"));
        match cli.command {
            Command::SignIn { email, password } => {
                assert_eq!(email, "a@b.com");
                assert!(password.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.api_base_url = "ftp://example.com".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.token_refresh_timeout = 0;
        assert!(bad.validate().is_err());
    }
}
