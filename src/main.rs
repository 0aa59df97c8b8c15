use anyhow::Result;
use clap::Parser;
use log::warn;
use pagefetch::client::FetchOptions;
use pagefetch::commands::{self, FetchSpec, config::Config};
use pagefetch::config::ConfigOverrides;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// pagefetch - fetch every page of a paginated JSON API
///
/// Follows the cursor chain of a collection endpoint, retrying transient
/// failures with exponential backoff, and prints all items as JSON.
///
/// If the PAGEFETCH_TOKEN environment variable is set, it is sent as a bearer token.
///
/// Examples:
///   pagefetch --base-url https://api.example.com fetch /v1/items
///   pagefetch fetch /v1/items --query limit=100 --ndjson
#[derive(Parser, Debug)]
#[command(author, version = env!("PAGEFETCH_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to <config dir>/pagefetch/config.json; also via PAGEFETCH_CONFIG)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// API base URL that paths are resolved against
    #[arg(long, env = "PAGEFETCH_BASE_URL", value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Maximum number of pages before giving up
    #[arg(long, value_name = "N", global = true)]
    max_pages: Option<usize>,

    /// Retries per page after the first attempt
    #[arg(long, value_name = "N", global = true)]
    max_retries: Option<u32>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Fetch all pages of one or more collections
    Fetch(FetchArgs),

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Collection paths (or absolute URLs); several paths are fetched concurrently
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<String>,

    /// Extra query parameter, repeatable
    #[arg(long = "query", short = 'q', value_name = "KEY=VALUE", value_parser = parse_query)]
    pub query: Vec<(String, String)>,

    /// Extra request header, repeatable
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Print items fetched before a failure
    #[arg(long)]
    pub partial: bool,

    /// Print one item per line
    #[arg(long)]
    pub ndjson: bool,
}

fn parse_query(s: &str) -> Result<(String, String), String> {
    commands::parse_query_pair(s).map_err(|e| e.to_string())
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    commands::parse_header_pair(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = pagefetch::runtime::RealRuntime;

    let partial = matches!(&cli.command, Commands::Fetch(args) if args.partial);
    let overrides = ConfigOverrides {
        base_url: cli.base_url,
        max_retries: cli.max_retries,
        max_pages: cli.max_pages,
        keep_partial: partial,
    };
    let config = Config::new(runtime, cli.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Fetch(args) => {
            let keep_partial = config.client.keep_partial;
            let client = config.into_api_client()?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling...");
                    on_signal.cancel();
                }
            });

            let spec = FetchSpec {
                paths: args.paths,
                query: args.query,
                headers: args.headers,
                ndjson: args.ndjson,
            };
            let options = FetchOptions::new()
                .with_cancel(cancel)
                .keep_partial(keep_partial);

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            commands::fetch(&client, &spec, &options, &mut out).await?
        }
        Commands::Config => {
            let stdout = std::io::stdout();
            commands::show_config(&config.client, &mut stdout.lock())?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_fetch_parsing() {
        let cli = Cli::try_parse_from([
            "pagefetch",
            "fetch",
            "/items",
            "-q",
            "limit=10",
            "-H",
            "X-Trace: 1",
            "--ndjson",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.paths, vec!["/items"]);
                assert_eq!(args.query, vec![("limit".to_string(), "10".to_string())]);
                assert_eq!(args.headers, vec![("X-Trace".to_string(), "1".to_string())]);
                assert!(args.ndjson);
                assert!(!args.partial);
            }
            _ => panic!("Expected Fetch command"),
        }
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pagefetch",
            "fetch",
            "/a",
            "/b",
            "--base-url",
            "http://localhost:1234",
            "--max-pages",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("http://localhost:1234"));
        assert_eq!(cli.max_pages, Some(7));
        match cli.command {
            Commands::Fetch(args) => assert_eq!(args.paths.len(), 2),
            _ => panic!("Expected Fetch command"),
        }
    }

    #[test]
    fn test_cli_config_parsing() {
        let cli = Cli::try_parse_from(["pagefetch", "--config", "/tmp/c.json", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
    }

    #[test]
    fn test_cli_fetch_requires_path() {
        assert!(Cli::try_parse_from(["pagefetch", "fetch"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_query() {
        assert!(Cli::try_parse_from(["pagefetch", "fetch", "/x", "-q", "oops"]).is_err());
    }

    #[test]
    fn test_cli_no_subcommand_fails() {
        assert!(Cli::try_parse_from(["pagefetch", "/items"]).is_err());
    }
}
