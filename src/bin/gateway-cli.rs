use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde_json::{json, Value};
use url::Url;

use stream_gateway::config::loader::load_config;
use stream_gateway::config::GatewayConfig;
use stream_gateway::http::request::parse;
use stream_gateway::security::SecurityPolicy;

/// Response headers worth showing for a relayed stream.
const RELAY_HEADERS: [&str; 7] = [
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "access-control-allow-origin",
    "x-ratelimit-remaining",
    "x-request-id",
];

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Operator CLI for the streaming gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run parsing and screening for a target offline and print the verdict
    Check {
        url: String,
        #[arg(long)]
        range: Option<String>,
        #[arg(long)]
        referer: Option<String>,
        /// Screen with this config's allowlists and rules instead of the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a configuration file
    ValidateConfig { file: PathBuf },
    /// Request a target through a running gateway and print the relay headers
    Probe {
        /// Gateway base URL, e.g. http://localhost:8080
        gateway: String,
        url: String,
        #[arg(long)]
        range: Option<String>,
        #[arg(long, default_value = "gateway-cli")]
        user_agent: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            url,
            range,
            referer,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => GatewayConfig::default(),
            };
            let report = check(&config, &url, range.as_deref(), referer.as_deref())?;
            let allowed = report["allowed"].as_bool().unwrap_or(false);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if allowed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::ValidateConfig { file } => match load_config(&file) {
            Ok(config) => {
                println!(
                    "{} is valid: {} rules ({}), {} allowlisted domains",
                    file.display(),
                    config.security.rules.rules.len(),
                    config.security.rules.version,
                    config.security.domain_allowlist.len()
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("{}: {e}", file.display());
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Probe {
            gateway,
            url,
            range,
            user_agent,
        } => {
            let mut endpoint = Url::parse(&gateway)?.join("/stream")?;
            endpoint.query_pairs_mut().append_pair("url", &url);

            let mut headers = HeaderMap::new();
            headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent)?);
            if let Some(range) = &range {
                headers.insert(RANGE, HeaderValue::from_str(range)?);
            }

            let res = reqwest::Client::new()
                .get(endpoint)
                .headers(headers)
                .send()
                .await?;
            print_reply(res).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run the offline stages in pipeline order and collect every verdict.
fn check(
    config: &GatewayConfig,
    raw_url: &str,
    range: Option<&str>,
    referer: Option<&str>,
) -> Result<Value, regex::Error> {
    let policy = SecurityPolicy::from_config(&config.security)?;

    let target = match parse(raw_url, range) {
        Ok(target) => target,
        Err(e) => {
            let scan = policy.detector.scan(raw_url);
            return Ok(json!({
                "url": raw_url,
                "allowed": false,
                "stage": "parse",
                "error": { "code": e.code(), "message": e.to_string() },
                "pattern": scan,
            }));
        }
    };

    let mut stages = vec![
        ("ssrf", policy.ssrf.evaluate(&target.url)),
        ("pattern", policy.detector.scan(raw_url)),
    ];
    if let Some(referer) = referer {
        stages.push(("pattern.referer", policy.detector.scan(referer)));
    }
    stages.push(("referrer", policy.referrer.check(&target.url, referer)));

    let denied = stages.iter().find(|(_, verdict)| verdict.is_denied());
    Ok(json!({
        "url": raw_url,
        "normalized": target.url.as_str(),
        "range": target.range.map(|r| json!({ "start": r.start, "end": r.end })),
        "rule_set": policy.detector.version(),
        "allowed": denied.is_none(),
        "stage": denied.map(|(stage, _)| *stage),
        "verdicts": stages
            .iter()
            .map(|(stage, verdict)| json!({ "stage": stage, "verdict": verdict }))
            .collect::<Vec<_>>(),
    }))
}

async fn print_reply(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    println!("Status: {}", status);
    for name in RELAY_HEADERS {
        if let Some(value) = res.headers().get(name) {
            println!("{name}: {}", value.to_str().unwrap_or("<binary>"));
        }
    }

    if !status.is_success() {
        let body: Value = res.json().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}
