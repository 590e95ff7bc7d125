//! Push-style delivery of call results.

use std::future::Future;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::client::{ClientError, ResultStream};
use crate::result::UnifiedResult;

/// Receiver of results for [`Client::call_with_callback`](crate::client::Client::call_with_callback).
pub trait ResultCallback: Send + Sync + 'static {
    /// One result was produced.
    fn on_event(&self, result: UnifiedResult);

    /// The call ended successfully. No further events follow.
    fn on_complete(&self) {}

    /// The call failed. No further events follow.
    fn on_error(&self, error: ClientError);
}

/// Spawn a task that drains the stream produced by `start` into `callback`.
///
/// Exactly one terminal method is invoked, even when `start` itself fails.
pub(crate) fn spawn_callback<F>(start: F, callback: Box<dyn ResultCallback>) -> JoinHandle<()>
where
    F: Future<Output = Result<ResultStream, ClientError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = match start.await {
            Ok(stream) => stream,
            Err(e) => {
                callback.on_error(e);
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(result) => callback.on_event(result),
                Err(e) => {
                    callback.on_error(e);
                    return;
                }
            }
        }
        callback.on_complete();
    })
}
