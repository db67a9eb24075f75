mod maintenance;
mod serve;

use anyhow::{Result, bail};
use console::style;

use crate::core::config::CoreConfig;
use crate::core::terminal::{self, GuideSection};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Start the execution API and maintenance scheduler")
        .print();

    GuideSection::new("Maintenance")
        .command("sweep", "Securely remove orphaned execution directories")
        .command(
            "rotate-keys",
            "Re-encrypt the vault under CONDUCTOR_NEW_MASTER_KEY",
        )
        .print();

    GuideSection::new("Options")
        .command("--api-host <host>", "Bind address for serve (default from conductor.toml)")
        .command("--api-port <port>", "Port for serve (default 17990)")
        .command("--max-age-secs <n>", "Minimum directory age for sweep")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("conductor").green()
    );
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub(crate) fn parse_sweep_flags(args: &[String], start: usize, default_secs: u64) -> u64 {
    let mut max_age = default_secs;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--max-age-secs" => {
                if i + 1 < args.len() {
                    max_age = args[i + 1].parse().unwrap_or(default_secs);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    max_age
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();

    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "serve" => {
            let config = CoreConfig::load(&data_dir)?;
            let (api_host, api_port) =
                parse_api_server_flags(&args, 2, config.api.host.clone(), config.api.port);
            serve::run_server(data_dir, config, api_host, api_port).await
        }
        "sweep" => {
            let config = CoreConfig::load(&data_dir)?;
            let max_age = parse_sweep_flags(&args, 2, config.ephemeral.orphan_max_age_secs);
            maintenance::run_sweep(&data_dir, config, max_age).await
        }
        "rotate-keys" => {
            let config = CoreConfig::load(&data_dir)?;
            maintenance::run_rotate_keys(&data_dir, config).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_help();
            bail!("Unknown command: {}", cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_api_server_flags, parse_sweep_flags};

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let args = args(&[
            "conductor",
            "serve",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
        ]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17990);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 19000);
    }

    #[test]
    fn invalid_port_keeps_the_configured_one() {
        let args = args(&["conductor", "serve", "--api-port", "not-a-port"]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 18000);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 18000);
    }

    #[test]
    fn parse_sweep_flags_defaults_to_config() {
        assert_eq!(parse_sweep_flags(&args(&["conductor", "sweep"]), 2, 3600), 3600);
        assert_eq!(
            parse_sweep_flags(&args(&["conductor", "sweep", "--max-age-secs", "0"]), 2, 3600),
            0
        );
    }
}
