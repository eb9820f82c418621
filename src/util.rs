use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a Sentry transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, Fut, R>(
    transaction_name: &str,
    callback: F,
) -> anyhow::Result<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "job.run");
    let tx = sentry_core::start_transaction(tx_ctx);

    Hub::current().configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().await;

    tx.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::InternalError,
    });
    tx.finish();

    result
}

/// Turn the payload of a caught panic into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
