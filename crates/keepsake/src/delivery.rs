//! Results of a dispatched call and the handle that receives them.
//!
//! A call sends at most two [`Delivery`] events into a small bounded channel
//! and closes it when done. Cache results always precede network results.

use crate::error::NetworkError;
use crate::message::{HttpResponse, ResponseSource};
use crate::strategy::Strategy;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use metrics::counter;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reason phrase of the synthetic response for an empty `ForceCache` lookup.
pub const UNSATISFIABLE_REASON: &str = "Unsatisfiable Request (only-if-cached)";

#[derive(Debug, Clone)]
pub enum Delivery {
    Response(HttpResponse),
    /// `ForceCache` found nothing fresh.
    NoCachedData,
    Failure(NetworkError),
}

impl Delivery {
    pub fn source(&self) -> ResponseSource {
        match self {
            Delivery::Response(response) => response.source,
            Delivery::NoCachedData => ResponseSource::Cache,
            Delivery::Failure(_) => ResponseSource::Network,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source() == ResponseSource::Cache
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Delivery::Response(response) => Some(response),
            _ => None,
        }
    }

    /// HTTP view of this delivery. `NoCachedData` becomes a 504.
    pub fn into_http_response(self) -> Result<HttpResponse, NetworkError> {
        match self {
            Delivery::Response(response) => Ok(response),
            Delivery::NoCachedData => {
                let mut response =
                    HttpResponse::new(StatusCode::GATEWAY_TIMEOUT, HeaderMap::new(), Bytes::new());
                response.reason = Some(UNSATISFIABLE_REASON.to_string());
                response.source = ResponseSource::Cache;
                Ok(response)
            }
            Delivery::Failure(error) => Err(error),
        }
    }
}

/// Runs delivery callbacks on a caller-chosen context.
pub trait DeliveryExecutor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks on the forwarding task itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl DeliveryExecutor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task()
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Queues callbacks for a thread that drains them with
/// [`TaskQueue::run_pending`], e.g. a UI or event loop.
#[derive(Clone)]
pub struct QueuedExecutor {
    tx: std_mpsc::Sender<Task>,
}

pub struct TaskQueue {
    rx: std_mpsc::Receiver<Task>,
}

impl QueuedExecutor {
    pub fn new() -> (Self, TaskQueue) {
        let (tx, rx) = std_mpsc::channel();
        (
            Self { tx },
            TaskQueue { rx },
        )
    }
}

impl DeliveryExecutor for QueuedExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        // A dropped queue means nobody is listening any more.
        let _ = self.tx.send(task);
    }
}

impl TaskQueue {
    /// Run every queued callback in submission order. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }
}

/// Receiving end of a dispatched call.
pub struct CallHandle {
    rx: mpsc::Receiver<Delivery>,
    token: CancellationToken,
    strategy: Strategy,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Next delivery, or `None` once the call is finished or canceled.
    pub async fn next(&mut self) -> Option<Delivery> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            delivery = self.rx.recv() => delivery,
        }
    }

    /// Stop delivering to this handle. Undelivered events are discarded; a
    /// network call already in flight still completes and is written back.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Every remaining delivery, in order.
    pub async fn collect(mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(self.strategy.max_deliveries());
        while let Some(delivery) = self.next().await {
            deliveries.push(delivery);
        }
        self.join().await;
        deliveries
    }

    /// Wait for the call to finish, including any write-back.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "call task ended abnormally");
            }
        }
    }

    /// Hand each delivery to `callback` through `executor`, in order.
    pub fn forward<F>(mut self, executor: Arc<dyn DeliveryExecutor>, callback: F) -> JoinHandle<()>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        tokio::spawn(async move {
            while let Some(delivery) = self.next().await {
                let callback = Arc::clone(&callback);
                executor.execute(Box::new(move || callback(delivery)));
            }
            self.join().await;
        })
    }

    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }
}

/// Sending end held by the running call.
pub(crate) struct Deliverer {
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
    delivered: usize,
}

impl Deliverer {
    pub(crate) async fn deliver(&mut self, delivery: Delivery) {
        if self.token.is_cancelled() {
            debug!("call canceled, dropping delivery");
            return;
        }
        counter!("keepsake_deliveries_total", "source" => delivery.source().as_str()).increment(1);
        if self.tx.send(delivery).await.is_err() {
            debug!("call handle dropped, delivery discarded");
        }
        self.delivered += 1;
    }

    pub(crate) fn delivered(&self) -> usize {
        self.delivered
    }
}

pub(crate) fn channel(strategy: Strategy) -> (Deliverer, CallHandle) {
    let (tx, rx) = mpsc::channel(strategy.max_deliveries().max(1));
    let token = CancellationToken::new();
    (
        Deliverer {
            tx,
            token: token.clone(),
            delivered: 0,
        },
        CallHandle {
            rx,
            token,
            strategy,
            task: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn no_cached_data_maps_to_gateway_timeout() {
        let response = Delivery::NoCachedData.into_http_response().unwrap();
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.reason_phrase(), UNSATISFIABLE_REASON);
        assert!(response.body.is_empty());
        assert!(Delivery::NoCachedData.is_from_cache());

        let failure = Delivery::Failure(NetworkError::Timeout);
        assert!(!failure.is_from_cache());
        assert_eq!(failure.into_http_response().unwrap_err(), NetworkError::Timeout);
    }

    #[tokio::test]
    async fn handle_yields_in_order_until_closed() {
        let (mut deliverer, handle) = channel(Strategy::CacheAndNetwork);
        deliverer.deliver(Delivery::NoCachedData).await;
        deliverer
            .deliver(Delivery::Failure(NetworkError::Connect("refused".into())))
            .await;
        drop(deliverer);

        let deliveries = handle.collect().await;
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[0].is_from_cache());
        assert!(matches!(deliveries[1], Delivery::Failure(_)));
    }

    #[tokio::test]
    async fn canceled_handle_receives_nothing() {
        let (mut deliverer, mut handle) = channel(Strategy::CacheAndNetwork);
        deliverer.deliver(Delivery::NoCachedData).await;
        handle.cancel();
        deliverer.deliver(Delivery::NoCachedData).await;

        assert!(handle.is_canceled());
        assert!(handle.next().await.is_none());
        assert_eq!(deliverer.delivered(), 1);
    }

    #[tokio::test]
    async fn forward_runs_callbacks_on_the_executor() {
        let (executor, queue) = QueuedExecutor::new();
        let (mut deliverer, handle) = channel(Strategy::CacheAndNetwork);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let forwarding = handle.forward(Arc::new(executor), move |delivery| {
            sink.lock().push(delivery.source());
        });
        deliverer.deliver(Delivery::NoCachedData).await;
        deliverer.deliver(Delivery::Failure(NetworkError::Timeout)).await;
        drop(deliverer);
        forwarding.await.unwrap();

        // Nothing runs until the owning loop drains the queue.
        assert!(seen.lock().is_empty());
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(
            *seen.lock(),
            vec![ResponseSource::Cache, ResponseSource::Network]
        );
    }
}
