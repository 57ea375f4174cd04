use flagrelay_core::{Event, HandlerConfig};
use flagrelay_runner::RequestHandler;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .without_time()
        .init();

    // Loaded once per container, reused across invocations.
    let handler = RequestHandler::new(HandlerConfig::load()?);
    info!(executable = %handler.config().executable.display(), "Handler ready");

    run(service_fn(move |event: LambdaEvent<Event>| {
        let handler = handler.clone();
        async move { function_handler(&handler, event).await }
    }))
    .await
}

async fn function_handler(
    handler: &RequestHandler,
    event: LambdaEvent<Event>,
) -> Result<Value, Error> {
    let outcome = handler.handle(&event.payload).await;
    Ok(outcome.into_result()?)
}
