use crate::config::{Config, Topology};
use crate::dispatch::CommandDispatcher;
use crate::gateway::{GatewayContext, SessionLimits, UpstreamMode};
use crate::upstream::{LinkSettings, UpstreamLink};
use std::sync::Arc;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;

    if command.as_deref() == Some("config-check") {
        return handle_config_check(&config);
    }
    if let Some(other) = command {
        return Err(format!("unknown command: {other} (expected config-init or config-check)").into());
    }

    if !config.has_access_token() {
        tracing::warn!("no access token configured (SUPERVISOR_TOKEN unset); feed authentication will fail");
    }

    let settings = LinkSettings::from_config(&config);
    let mut shared_link = None;
    let upstream = match config.upstream.topology {
        Topology::PerPeer => UpstreamMode::PerPeer(settings),
        Topology::Shared => {
            let (handle, task) = UpstreamLink::spawn(settings);
            shared_link = Some(task);
            UpstreamMode::Shared(handle)
        }
    };

    let ctx = Arc::new(GatewayContext {
        dispatcher: CommandDispatcher::new(config.server.enable_generic_call_service),
        upstream,
        allow_list: config.allow_list()?,
        limits: SessionLimits::from_config(&config),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(
        addr = %addr,
        feed = %config.feed_url(),
        topology = ?config.upstream.topology,
        generic_call_service = config.server.enable_generic_call_service,
        "starting bridge"
    );

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        res = crate::gateway::start(&addr, ctx) => res.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
        _ = terminate() => {
            tracing::info!("shutdown: terminate");
            Ok(())
        }
    };

    if let Some(task) = shared_link {
        task.abort();
    }
    result
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_config_check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("# config ok");
    println!("# feed url: {}", config.feed_url());
    print!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}
