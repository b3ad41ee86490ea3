use std::{process, sync::Arc};

use portal_sync::{
    cache::{
        Mutation, Query, QueryCache, QueryCacheConfig, QueryError, QueryOutcome, QueryState,
        RequestKey,
    },
    channel::EventChannel,
    config::{self, Command, GetArgs, MutateArgs, Settings, WatchArgs, params_object},
    error::AppError,
    identity::IdentitySource,
    infra::{http::HttpBackend, socket::WebSocketTransport, telemetry},
    portal::{PortalConfig, PortalSync},
};
use serde_json::Value;
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

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Watch(args) => run_watch(settings, args).await,
        Command::Get(args) => run_get(settings, args).await,
        Command::Mutate(args) => run_mutate(settings, args).await,
    }
}

fn build_cache(settings: &Settings, identity: IdentitySource) -> Result<QueryCache, AppError> {
    let backend = HttpBackend::new(&settings.api)?;
    Ok(QueryCache::new(
        QueryCacheConfig::from(&settings.cache),
        Arc::new(backend),
        identity,
    ))
}

async fn run_watch(settings: Settings, args: WatchArgs) -> Result<(), AppError> {
    let identity = IdentitySource::new();
    let cache = build_cache(&settings, identity.clone())?;
    let transport = WebSocketTransport::from_settings(&settings.channel);
    let channel = EventChannel::new(Arc::new(transport), settings.channel.reconnect);
    let portal = PortalSync::new(cache, channel, PortalConfig::from(&settings.portal));

    let sync = portal.start();
    identity.login(args.user.as_str());

    let mut notifications = portal.cache().subscribe(portal.notifications_query()?);
    let mut states = portal.channel().watch_state();
    let mut unread = portal.unread().watch();
    info!(user = %args.user, "Watching notifications; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for Ctrl-C");
                }
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(state = %state, "Channel state");
            }
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *unread.borrow_and_update();
                info!(unread = count, "Unread notifications");
            }
            state = notifications.changed() => {
                let Some(state) = state else {
                    break;
                };
                log_query_state(&state);
            }
        }
    }

    sync.abort();
    portal.apply_identity(None).await;
    Ok(())
}

async fn run_get(settings: Settings, args: GetArgs) -> Result<(), AppError> {
    let cache = build_cache(&settings, IdentitySource::new())?;
    let key = RequestKey::parse(&args.endpoint, params_object(&args.params))?;

    let mut subscription = cache.subscribe(Query::from_key(key));
    let state = subscription.settled().await;
    match state.outcome() {
        QueryOutcome::Ready { data, .. } => print_json(data),
        QueryOutcome::Failed { error, .. } => Err(QueryError::Backend(error.clone()).into()),
        QueryOutcome::Idle | QueryOutcome::Loading => {
            Err(AppError::unexpected("fetch finished without a result"))
        }
    }
}

async fn run_mutate(settings: Settings, args: MutateArgs) -> Result<(), AppError> {
    let identity = IdentitySource::with_user(args.user.as_str());
    let cache = build_cache(&settings, identity)?;

    let body = args
        .body
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|err| AppError::validation(format!("--body is not valid JSON: {err}")))?;

    let mut mutation = Mutation::new(&args.endpoint)?
        .params(params_object(&args.params))?
        .invalidates(args.invalidates.iter().map(String::as_str));
    if let Some(body) = body {
        mutation = mutation.body(body);
    }

    let result = cache.mutate(mutation).await?;
    print_json(&result)
}

fn log_query_state(state: &QueryState) {
    match state.outcome() {
        QueryOutcome::Ready { data, refreshing } => {
            let items = data.as_array().map(Vec::len);
            info!(refreshing, stale = state.is_stale, items, "Notifications updated");
        }
        QueryOutcome::Failed { error, last_good } => {
            warn!(
                error = %error,
                has_data = last_good.is_some(),
                "Notifications fetch failed"
            );
        }
        QueryOutcome::Idle | QueryOutcome::Loading => {}
    }
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render response: {err}")))?;
    println!("{text}");
    Ok(())
}
