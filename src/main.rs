use std::{
    future::IntoFuture,
    io::{self, Write},
    process,
};

use hearth::{
    application::{
        assets::{AssetPolicy, AssetService},
        error::AppError,
    },
    cache::CacheConfig,
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    resources::ResourceStore,
    templates::TemplateManager,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = ResourceStore::new(&settings.resources.root)?;
    let policy = AssetPolicy {
        minify: settings.resources.minify,
        less_fallback: settings.resources.less_fallback,
        pretty_json: settings.resources.pretty_json,
    };
    let assets = AssetService::new(store, CacheConfig::from(&settings.executor), policy);
    let state = HttpState::new(assets, settings.resources.cache_seconds);

    info!(
        root = %settings.resources.root.display(),
        minify = policy.minify,
        workers = settings.executor.workers.get(),
        queue_size = settings.executor.queue_size,
        "asset service ready"
    );

    serve_http(&settings, state).await
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| InfraError::bind(settings.server.addr.to_string(), err))?;
    info!(addr = %settings.server.addr, "listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = stop_rx.await;
        },
    );
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(InfraError::from)?;
        }
    }

    info!(
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "shutdown requested; draining connections"
    );
    let _ = stop_tx.send(());

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!("graceful shutdown timed out; aborting open connections");
            server.abort();
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let scope = load_scope(&args).await?;
    let store = ResourceStore::new(&settings.templates.root)?;
    let manager = TemplateManager::new(
        store,
        CacheConfig::from(&settings.executor),
        &settings.templates.suffix,
    );

    let template = manager.compile(&args.name).await?;
    let output = template.execute(&scope).await?;

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .and_then(|()| stdout.flush())
        .map_err(InfraError::from)?;
    Ok(())
}

async fn load_scope(args: &config::RenderArgs) -> Result<Value, AppError> {
    let raw = match (&args.scope, &args.scope_json) {
        (Some(path), _) => tokio::fs::read_to_string(path)
            .await
            .map_err(InfraError::from)?,
        (None, Some(inline)) => inline.clone(),
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("scope is not valid JSON: {err}")))
}
