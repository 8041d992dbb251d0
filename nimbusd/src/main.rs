use nimbusd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: nimbusd");
            println!("Configuration is read from the environment:");
            println!("  NIMBUS_TOKEN               API bearer token (required)");
            println!("  NIMBUS_API_BASE            store API base url");
            println!("  NIMBUS_DATA_DIR            materialized tree location");
            println!("  NIMBUS_ACCOUNT_ROOT        remote root to mirror");
            println!("  NIMBUS_CHANGES_POLL_SECS   change feed poll interval");
            println!("  NIMBUS_IDLE_TIMEOUT_SECS   watchdog idle schedule, e.g. 60,90,180");
            println!("  NIMBUS_RETRY_BACKOFF_SECS  watchdog backoff schedule, e.g. 2,4");
            println!("  NIMBUS_ENABLE_LOCAL_WATCHER  watch the materialized tree (default on)");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["nimbusd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["nimbusd".to_string(), "--help".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(vec!["nimbusd".to_string(), "--verbose".to_string()]).is_err());
    }
}
