use browser_extra::browser::ChromeEngine;
use browser_extra::plugins::builtin::{self, LaunchArgs, UserAgentOverride};
use browser_extra::{Config, Orchestrator};
use clap::{Arg, ArgAction, Command};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("browser-extra")
        .about("Launch or attach to Chrome with the bundled plugins")
        .arg(
            Arg::new("headful")
                .long("headful")
                .action(ArgAction::SetTrue)
                .help("Show the browser window"),
        )
        .arg(
            Arg::new("connect")
                .long("connect")
                .value_name("WS_ENDPOINT")
                .help("Attach to a running browser instead of launching one"),
        )
        .arg(
            Arg::new("user-agent")
                .long("user-agent")
                .value_name("UA")
                .help("User agent for new pages"),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .default_value("https://example.com")
                .help("Page to open"),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();
    let headful = matches.get_flag("headful");
    let url = matches
        .get_one::<String>("url")
        .cloned()
        .unwrap_or_else(|| "https://example.com".to_string());

    let user_agent_options = match matches.get_one::<String>("user-agent") {
        Some(ua) => json!({ "userAgent": ua }),
        None => json!({}),
    };

    let orchestrator = Orchestrator::new(Arc::new(ChromeEngine::new()))
        .with_config(Config::default())
        .with_loader(Arc::new(builtin::catalog()));
    orchestrator
        .use_plugin(Arc::new(LaunchArgs::with_args(["--mute-audio"])))
        .use_plugin(Arc::new(UserAgentOverride::new(user_agent_options)?));

    let browser = match matches.get_one::<String>("connect") {
        Some(endpoint) => {
            orchestrator
                .connect(json!({ "browserWSEndpoint": endpoint }))
                .await?
        }
        None => orchestrator.launch(json!({ "headless": !headful })).await?,
    };
    info!(session = %browser.session_id(), plugins = ?orchestrator.plugin_names(), "Browser ready");

    let page = browser.new_page().await?;
    page.goto(&url).await?;
    info!(url = %page.url(), user_agent = %page.user_agent().await?, "Page loaded");

    if headful {
        info!("Press ctrl-c to close the browser");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to wait for ctrl-c");
        }
    }

    browser.close().await?;
    Ok(())
}
