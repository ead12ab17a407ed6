use std::sync::Arc;

use futures::future::BoxFuture;
use lapin::Channel;
use tokio::time::sleep;
use tracing::debug;

use super::broker_channel::BrokerChannel;
use super::channel_manager::ChannelSetup;
use super::consumer::{Consumer, ConsumerOptions, Listener};
use super::dispatch::{handle_batch, BatchProcessor, ProcessingOutcome};
use super::errors::Result;
use super::instrumentation::Instrumentation;

/// Declares the listener's topology on every (re)opened channel, then
/// starts a pull loop handing `batch_quantity` messages at a time to the
/// processor.
pub(crate) async fn register<P>(listener: Listener<P>) -> Result<Consumer>
where
    P: BatchProcessor + ?Sized,
{
    listener.metrics.register_queue(&listener.queue);
    let listener = Arc::new(listener);

    let setup: ChannelSetup = {
        let listener = listener.clone();
        Arc::new(move |channel: Channel| -> BoxFuture<'static, Result<()>> {
            let listener = listener.clone();
            Box::pin(async move {
                listener.topology.apply(&channel).await?;
                listener.report_listening();
                tokio::spawn(poll(channel, listener));
                Ok(())
            })
        })
    };

    let channel = listener
        .supervisor
        .create_channel(listener.channel_options(), setup)
        .await?;
    Ok(Consumer::new(listener.queue.clone(), channel))
}

async fn poll<P>(channel: Channel, listener: Arc<Listener<P>>)
where
    P: BatchProcessor + ?Sized,
{
    let batches = poll_until_closed(
        &channel,
        &listener.queue,
        &listener.options,
        listener.processor.as_ref(),
        &listener.metrics,
    )
    .await;
    debug!(target: "rabbitmq", queue = %listener.queue, batches, "Batch polling stopped");
    listener.supervisor.recover(&listener.channel_id);
}

/// Pulls batches for as long as the channel stays open, idling while the
/// queue is empty or the broker fails a pull. A reopened channel starts its
/// own loop. Returns the number of batches handled.
pub(crate) async fn poll_until_closed<C, P>(
    channel: &C,
    queue: &str,
    options: &ConsumerOptions,
    processor: &P,
    metrics: &Instrumentation,
) -> usize
where
    C: BrokerChannel + ?Sized,
    P: BatchProcessor + ?Sized,
{
    let mut batches = 0;
    while channel.is_open() {
        match handle_batch(channel, queue, options.batch_quantity, processor, metrics).await {
            None | Some(ProcessingOutcome::BrokerError) => sleep(options.idle_interval).await,
            Some(_) => batches += 1,
        }
    }
    batches
}
