use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::ready;
use tokio::{
    sync::mpsc,
    time::{sleep, Instant, Sleep},
};
use tracing::{debug, trace, warn};

use crate::common::{ClientId, SessionId};

/// A heartbeat expiration: the session of the client whose timer ran out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expiration {
    pub client_id: ClientId,
    pub session: SessionId,
}

struct ExpirationNotifier(Option<(Expiration, mpsc::UnboundedSender<Expiration>)>);

impl ExpirationNotifier {
    fn run(&mut self) {
        if let Some((expiration, channel)) = self.0.take() {
            channel.send(expiration).unwrap_or_else(|_| {
                warn!("failed to send timer expiration notification: channel is closed")
            });
        }
    }
}

/// A future that resolves when a client did not reset it in time, or when the client is gone.
///
/// The timer notifies the expiration channel only in the first case. Dropping the reset sender
/// ends the timer silently.
pub struct HeartBeatTimer {
    expiration_notifier: ExpirationNotifier,
    resets: mpsc::Receiver<Duration>,
    timer: Pin<Box<Sleep>>,
}

impl HeartBeatTimer {
    pub fn new(
        client_id: ClientId,
        session: SessionId,
        delay: Duration,
        expiration_tx: mpsc::UnboundedSender<Expiration>,
        resets_rx: mpsc::Receiver<Duration>,
    ) -> Self {
        Self {
            expiration_notifier: ExpirationNotifier(Some((
                Expiration { client_id, session },
                expiration_tx,
            ))),
            resets: resets_rx,
            timer: Box::pin(sleep(delay)),
        }
    }

    fn poll_resets(&mut self, cx: &mut Context) -> Poll<()> {
        loop {
            match ready!(self.resets.poll_recv(cx)) {
                Some(duration) => {
                    self.timer.as_mut().reset(Instant::now() + duration);
                    debug!("heartbeat timer reset");
                }
                None => return Poll::Ready(()),
            }
        }
    }

    fn poll_timer(&mut self, cx: &mut Context) -> Poll<()> {
        ready!(self.timer.as_mut().poll(cx));
        self.expiration_notifier.run();
        Poll::Ready(())
    }
}

impl Future for HeartBeatTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        trace!("polling heartbeat timer");
        if let Poll::Ready(()) = self.as_mut().poll_resets(cx) {
            trace!("dropping heartbeat timer: reset channel closed");
            return Poll::Ready(());
        }
        if let Poll::Ready(()) = self.as_mut().poll_timer(cx) {
            trace!("heartbeat timer expired");
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn timer(
        delay: Duration,
    ) -> (
        HeartBeatTimer,
        mpsc::Sender<Duration>,
        mpsc::UnboundedReceiver<Expiration>,
        SessionId,
    ) {
        let (expiration_tx, expiration_rx) = mpsc::unbounded_channel();
        let (reset_tx, reset_rx) = mpsc::channel(10);
        let session = SessionId::new();
        let timer = HeartBeatTimer::new(
            ClientId::from("client"),
            session,
            delay,
            expiration_tx,
            reset_rx,
        );
        (timer, reset_tx, expiration_rx, session)
    }

    #[tokio::test]
    async fn test_timer_expires() {
        tokio::time::pause();
        let (timer, _reset_tx, mut expiration_rx, session) = timer(Duration::from_secs(10));
        let handle = tokio::spawn(timer);

        tokio::time::advance(Duration::from_secs(11)).await;
        handle.await.unwrap();

        let expiration = expiration_rx.recv().await.unwrap();
        assert_eq!(expiration.client_id, ClientId::from("client"));
        assert_eq!(expiration.session, session);
    }

    #[tokio::test]
    async fn test_timer_reset_postpones_expiration() {
        tokio::time::pause();
        let (timer, reset_tx, mut expiration_rx, _) = timer(Duration::from_secs(10));
        let handle = tokio::spawn(timer);

        tokio::time::advance(Duration::from_secs(8)).await;
        reset_tx.send(Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(expiration_rx.recv().now_or_never().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        handle.await.unwrap();
        assert!(expiration_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_timer_dropped_without_notification() {
        tokio::time::pause();
        let (timer, reset_tx, mut expiration_rx, _) = timer(Duration::from_secs(10));
        let handle = tokio::spawn(timer);

        drop(reset_tx);
        handle.await.unwrap();
        assert!(expiration_rx.recv().await.is_none());
    }
}
