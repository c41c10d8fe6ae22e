//! Built-in operations.
//!
//! Small, self-contained workers that are always available to a pipeline file:
//! - `Echo`: answers every signal by sending its name back to the sender
//! - `Logger`: writes every signal it sees to the log

use async_trait::async_trait;

use crate::bridge::protocol::{Signal, names};
use crate::entity::{BridgeClosed, Context, Entity, SHUTDOWN, Transition};
use crate::registry::OperationRegistry;

/// Registry holding every built-in operation.
pub fn builtin() -> OperationRegistry {
    OperationRegistry::new()
        .with("Echo", |_| Ok(Box::new(Echo)))
        .with("Logger", |_| Ok(Box::new(Logger::default())))
}

/// Receive until `stop` or bridge loss, handing every other named signal to
/// `on_signal`.
async fn serve<F>(ctx: &mut Context, mut on_signal: F) -> Transition
where
    F: FnMut(&Context, Signal) + Send,
{
    loop {
        let signal = match ctx.recv().await {
            Ok(Some(signal)) => signal,
            Ok(None) => continue,
            Err(BridgeClosed) => return Transition::Exit(SHUTDOWN),
        };
        if signal.is_stop() {
            ctx.stop_bridge();
            return Transition::Exit(SHUTDOWN);
        }
        if signal.name.is_empty() {
            continue;
        }
        on_signal(ctx, signal);
    }
}

pub struct Echo;

#[async_trait]
impl Entity for Echo {
    async fn started(&mut self, ctx: &mut Context) -> Transition {
        serve(ctx, |ctx, signal| {
            if names::is_advisory(&signal.name)
                || signal.sender.is_empty()
                || signal.sender == ctx.identity()
            {
                return;
            }
            ctx.emit(signal.name, signal.sender);
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct Logger {
    seen: u64,
}

#[async_trait]
impl Entity for Logger {
    async fn started(&mut self, ctx: &mut Context) -> Transition {
        let seen = &mut self.seen;
        let transition = serve(ctx, |ctx, signal| {
            *seen += 1;
            tracing::info!(
                entity = %ctx.identity(),
                signal = %signal.name,
                sender = %signal.sender,
                recipient = %signal.recipient,
                timestamp = signal.timestamp,
                "Signal"
            );
        })
        .await;
        tracing::info!(entity = %ctx.identity(), seen = self.seen, "Logger done");
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bridge::protocol::Outgoing;
    use crate::channel::{Offer, Poll, queue};
    use crate::entity::run;

    fn context() -> (
        Context,
        tokio::sync::mpsc::Sender<Signal>,
        tokio::sync::mpsc::Receiver<Outgoing>,
    ) {
        let (in_tx, in_rx) = queue(16);
        let (out_tx, out_rx) = queue(16);
        (
            Context::new("Echo", in_rx, out_tx, Duration::from_millis(1)),
            in_tx,
            out_rx,
        )
    }

    #[test]
    fn builtin_registry_knows_both() {
        assert_eq!(builtin().identities(), vec!["Echo", "Logger"]);
    }

    #[tokio::test]
    async fn echo_answers_sender() {
        let (mut ctx, in_tx, mut out_rx) = context();
        in_tx.offer(Signal::new("started", "pm", "Echo", 1.0)).unwrap();
        in_tx.offer(Signal::new("ping", "A", "Echo", 1.0)).unwrap();
        in_tx.offer(Signal::new("idle", "B", "", 1.0)).unwrap();
        in_tx.offer(Signal::new("anon", "", "", 1.0)).unwrap();
        in_tx.offer(Signal::new("stop", "pm", "Echo", 1.0)).unwrap();

        assert_eq!(run(&mut Echo, &mut ctx).await, SHUTDOWN);

        let sent: Vec<Outgoing> = std::iter::from_fn(|| out_rx.poll().ok().flatten()).collect();
        assert_eq!(
            sent,
            vec![
                Outgoing::to("idle", ""),
                Outgoing::to("ping", "A"),
                Outgoing::bridge("stop"),
            ]
        );
    }

    #[tokio::test]
    async fn logger_counts_what_it_sees() {
        let (mut ctx, in_tx, _out_rx) = context();
        in_tx.offer(Signal::new("started", "pm", "Echo", 1.0)).unwrap();
        in_tx.offer(Signal::new("a", "A", "", 1.0)).unwrap();
        in_tx.offer(Signal::new("b", "B", "", 2.0)).unwrap();
        in_tx.offer(Signal::new("stop", "pm", "", 3.0)).unwrap();

        let mut logger = Logger::default();
        assert_eq!(run(&mut logger, &mut ctx).await, SHUTDOWN);
        assert_eq!(logger.seen, 2);
    }

    #[tokio::test]
    async fn bridge_loss_ends_echo() {
        let (mut ctx, in_tx, _out_rx) = context();
        in_tx.offer(Signal::new("started", "pm", "Echo", 1.0)).unwrap();
        let mut echo = Echo;
        let task = tokio::spawn(async move { run(&mut echo, &mut ctx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(in_tx);
        let code = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, SHUTDOWN);
    }
}
