use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fastrace::collector::SpanContext;
use fastrace::future::FutureExt;
use fastrace::Span;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::decoder::RecordDecoder;
use crate::error::{ResultsError, ResultsResult};
use crate::mode::RetrievalMode;
use crate::record::{Record, ResultBatch, Schema};
use crate::source::{ByteStream, SourceGuard};

/// Receives the batches of a [`ResultStream`].
///
/// The callbacks of one observer are never invoked concurrently.
/// Exactly one of `on_error` or `on_completed` is invoked last,
/// unless the subscription is cancelled first.
pub trait Observer: Send + 'static {
    fn on_next(&mut self, batch: Arc<ResultBatch>);
    fn on_error(&mut self, error: ResultsError);
    fn on_completed(&mut self);
}

/// An [`Observer`] built from closures.
pub struct FnObserver<N, E, C> {
    on_next: N,
    on_error: E,
    on_completed: C,
}

impl<N, E, C> FnObserver<N, E, C>
where
    N: FnMut(Arc<ResultBatch>) + Send + 'static,
    E: FnMut(ResultsError) + Send + 'static,
    C: FnMut() + Send + 'static,
{
    pub fn new(on_next: N, on_error: E, on_completed: C) -> Self {
        Self {
            on_next,
            on_error,
            on_completed,
        }
    }
}

impl<N, E, C> Observer for FnObserver<N, E, C>
where
    N: FnMut(Arc<ResultBatch>) + Send + 'static,
    E: FnMut(ResultsError) + Send + 'static,
    C: FnMut() + Send + 'static,
{
    fn on_next(&mut self, batch: Arc<ResultBatch>) {
        (self.on_next)(batch)
    }

    fn on_error(&mut self, error: ResultsError) {
        (self.on_error)(error)
    }

    fn on_completed(&mut self) {
        (self.on_completed)()
    }
}

/// Marks a realtime search as cancelled.
///
/// A realtime search never ends on its own, so a stream attached to one
/// delivers every batch as a preview until the search is cancelled. After
/// that, at most one final batch is delivered. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl PartialEq for Cancellation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

enum Delivery {
    Batch(Arc<ResultBatch>),
    Failed(ResultsError),
}

#[derive(Clone)]
enum Terminal {
    Completed,
    Failed(ResultsError),
}

struct StreamState {
    /// The byte source before the stream starts.
    /// It is moved into the pump task on the first subscription.
    source: Option<ByteStream>,
    subscribers: HashMap<u64, mpsc::Sender<Delivery>>,
    next_subscriber_id: u64,
    terminal: Option<Terminal>,
    field_names: Arc<Schema>,
    final_delivered: bool,
}

struct Shared {
    mode: RetrievalMode,
    queue_size: usize,
    /// Present if the stream reads a realtime search.
    cancellation: Option<Cancellation>,
    state: Mutex<StreamState>,
    /// Wakes up the pump when a subscriber leaves.
    departed: Notify,
}

impl Shared {
    fn subscriber_count(&self) -> ResultsResult<usize> {
        Ok(self.state.lock()?.subscribers.len())
    }

    fn targets(&self) -> ResultsResult<Vec<(u64, mpsc::Sender<Delivery>)>> {
        let state = self.state.lock()?;
        Ok(state
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect())
    }

    fn remove(&self, id: u64) -> ResultsResult<()> {
        let removed = self.state.lock()?.subscribers.remove(&id).is_some();
        if removed {
            debug!("subscriber {id} left the {} stream", self.mode);
            self.departed.notify_one();
        }
        Ok(())
    }

    fn final_delivered(&self) -> ResultsResult<bool> {
        Ok(self.state.lock()?.final_delivered)
    }

    async fn publish(&self, mut batch: ResultBatch) -> ResultsResult<()> {
        if let Some(cancellation) = &self.cancellation {
            if self.final_delivered()? {
                debug!("dropping a batch after the final batch of the {} stream", self.mode);
                return Ok(());
            }
            if batch.is_final && !cancellation.is_cancelled() {
                batch.is_final = false;
            }
        }
        if !self.mode.delivers(&batch) {
            return Ok(());
        }
        let batch = Arc::new(batch);
        {
            let mut state = self.state.lock()?;
            state.field_names = batch.schema.clone();
            state.final_delivered |= batch.is_final;
        }
        for (id, tx) in self.targets()? {
            // The send waits for queue space, which holds back reading
            // from the source until the slowest subscriber catches up.
            if tx.send(Delivery::Batch(batch.clone())).await.is_err() {
                self.remove(id)?;
            }
        }
        Ok(())
    }

    async fn terminate(&self, terminal: Terminal) -> ResultsResult<()> {
        let subscribers = {
            let mut state = self.state.lock()?;
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.subscribers)
        };
        if let Terminal::Failed(e) = terminal {
            for tx in subscribers.values() {
                let _ = tx.send(Delivery::Failed(e.clone())).await;
            }
        }
        // Dropping the senders completes the remaining subscribers.
        Ok(())
    }
}

/// A hot, multicast sequence of result batches decoded from one byte source.
///
/// Reading starts with the first subscription. Later subscribers receive the
/// batches produced after they subscribe. The source is released once the
/// stream completes, fails, or has no subscribers left.
#[derive(Clone)]
pub struct ResultStream {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("mode", &self.shared.mode)
            .finish_non_exhaustive()
    }
}

impl ResultStream {
    pub fn new(mode: RetrievalMode, source: ByteStream, queue_size: usize) -> Self {
        Self::create(mode, source, queue_size, None)
    }

    /// Creates a stream for a realtime search, which has no final batch
    /// before `cancellation` is set.
    pub fn realtime(
        mode: RetrievalMode,
        source: ByteStream,
        queue_size: usize,
        cancellation: Cancellation,
    ) -> Self {
        Self::create(mode, source, queue_size, Some(cancellation))
    }

    fn create(
        mode: RetrievalMode,
        source: ByteStream,
        queue_size: usize,
        cancellation: Option<Cancellation>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                queue_size: queue_size.max(1),
                cancellation,
                state: Mutex::new(StreamState {
                    source: Some(source),
                    subscribers: HashMap::new(),
                    next_subscriber_id: 0,
                    terminal: None,
                    field_names: Arc::new(Schema::empty()),
                    final_delivered: false,
                }),
                departed: Notify::new(),
            }),
        }
    }

    pub fn mode(&self) -> RetrievalMode {
        self.shared.mode
    }

    /// The schema of the most recently delivered batch.
    pub fn field_names(&self) -> ResultsResult<Arc<Schema>> {
        Ok(self.shared.state.lock()?.field_names.clone())
    }

    /// Attaches an observer. The observer is called from a separate task.
    /// Dropping the returned subscription cancels it.
    pub fn subscribe(&self, mut observer: impl Observer) -> ResultsResult<Subscription> {
        let (mut subscription, receiver) = match self.attach()? {
            Attachment::Live {
                subscription,
                receiver,
            } => (subscription, receiver),
            Attachment::Terminated(terminal) => {
                match terminal {
                    Terminal::Completed => observer.on_completed(),
                    Terminal::Failed(e) => observer.on_error(e),
                }
                return Ok(Subscription::detached());
            }
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(deliver(receiver, cancel_rx, observer));
        subscription.cancel = Some(cancel_tx);
        Ok(subscription)
    }

    /// Cancels the subscription. This is the same as [`Subscription::cancel`].
    pub fn cancel(&self, subscription: &mut Subscription) {
        subscription.cancel();
    }

    /// Returns the records of the stream as a lazy sequence backed by a new
    /// subscription. Only the records of final batches are included,
    /// except for [`RetrievalMode::Events`] which includes all records.
    pub fn to_sequence(&self) -> ResultsResult<impl Stream<Item = ResultsResult<Record>>> {
        let mode = self.shared.mode;
        let attachment = self.attach()?;
        Ok(async_stream::stream! {
            let (_subscription, mut receiver) = match attachment {
                Attachment::Live { subscription, receiver } => (subscription, receiver),
                Attachment::Terminated(Terminal::Completed) => return,
                Attachment::Terminated(Terminal::Failed(e)) => {
                    yield Err(e);
                    return;
                }
            };
            while let Some(delivery) = receiver.recv().await {
                match delivery {
                    Delivery::Batch(batch) => {
                        if mode.yields_records(&batch) {
                            for record in batch.records.iter() {
                                yield Ok(record.clone());
                            }
                        }
                    }
                    Delivery::Failed(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    fn attach(&self) -> ResultsResult<Attachment> {
        let mut state = self.shared.state.lock()?;
        if let Some(terminal) = &state.terminal {
            return Ok(Attachment::Terminated(terminal.clone()));
        }
        let (tx, rx) = mpsc::channel(self.shared.queue_size);
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, tx);
        if let Some(source) = state.source.take() {
            let span = Span::root("ResultStream::pump", SpanContext::random());
            tokio::spawn(pump(self.shared.clone(), source).in_span(span));
        }
        debug!("subscriber {id} joined the {} stream", self.shared.mode);
        Ok(Attachment::Live {
            subscription: Subscription {
                id: Some(id),
                shared: Arc::downgrade(&self.shared),
                cancel: None,
            },
            receiver: rx,
        })
    }
}

enum Attachment {
    Live {
        subscription: Subscription,
        receiver: mpsc::Receiver<Delivery>,
    },
    Terminated(Terminal),
}

/// A handle for one subscriber of a [`ResultStream`].
#[must_use = "dropping a subscription cancels it"]
pub struct Subscription {
    id: Option<u64>,
    shared: std::sync::Weak<Shared>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    fn detached() -> Self {
        Self {
            id: None,
            shared: std::sync::Weak::new(),
            cancel: None,
        }
    }

    /// Stops the delivery of further batches to this subscriber.
    /// A batch that is being delivered is not interrupted.
    /// Cancelling more than once has no effect.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let (Some(id), Some(shared)) = (self.id.take(), self.shared.upgrade()) {
            if let Err(e) = shared.remove(id) {
                warn!("failed to remove subscriber {id}: {e}");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some() && self.shared.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn deliver(
    mut receiver: mpsc::Receiver<Delivery>,
    mut cancelled: oneshot::Receiver<()>,
    mut observer: impl Observer,
) {
    let mut cancellable = true;
    loop {
        tokio::select! {
            biased;
            signal = &mut cancelled, if cancellable => {
                match signal {
                    Ok(()) => return,
                    Err(_) => cancellable = false,
                }
            }
            delivery = receiver.recv() => match delivery {
                Some(Delivery::Batch(batch)) => observer.on_next(batch),
                Some(Delivery::Failed(e)) => {
                    observer.on_error(e);
                    return;
                }
                None => {
                    observer.on_completed();
                    return;
                }
            }
        }
    }
}

enum ReadOutcome {
    Completed,
    Abandoned,
}

async fn pump(shared: Arc<Shared>, source: ByteStream) {
    let mode = shared.mode;
    let mut source = SourceGuard::new(source);
    let terminal = match read(&shared, &mut source).await {
        Ok(ReadOutcome::Completed) => {
            debug!("the {mode} stream completed");
            Terminal::Completed
        }
        Ok(ReadOutcome::Abandoned) => {
            debug!("the {mode} stream has no subscribers left");
            Terminal::Completed
        }
        Err(e) => {
            warn!("the {mode} stream failed: {e}");
            Terminal::Failed(e)
        }
    };
    source.release();
    if let Err(e) = shared.terminate(terminal).await {
        warn!("failed to terminate the {mode} stream: {e}");
    }
}

/// Reads the source to the end and publishes the decoded batches.
async fn read(shared: &Shared, source: &mut SourceGuard) -> ResultsResult<ReadOutcome> {
    let mut decoder = RecordDecoder::new();
    loop {
        if shared.subscriber_count()? == 0 {
            return Ok(ReadOutcome::Abandoned);
        }
        let Some(reader) = source.get_mut() else {
            return Err(ResultsError::internal("byte source already released"));
        };
        let chunk = tokio::select! {
            chunk = reader.next() => chunk,
            _ = shared.departed.notified() => continue,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for batch in decoder.feed(&bytes)? {
                    shared.publish(batch).await?;
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                for batch in decoder.finish()? {
                    shared.publish(batch).await?;
                }
                if shared.mode == RetrievalMode::Results && !shared.final_delivered()? {
                    debug!("the source ended without final results");
                    let empty = ResultBatch {
                        schema: Arc::new(Schema::empty()),
                        records: vec![],
                        is_final: true,
                    };
                    shared.publish(empty).await?;
                }
                return Ok(ReadOutcome::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use futures::stream;
    use futures::TryStreamExt;

    use super::*;
    use crate::source::TransportError;

    fn document(preview: bool, rows: &[&str]) -> String {
        let preview = if preview { 1 } else { 0 };
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, v)| {
                format!("<result offset='{i}'><field k='v'><value><text>{v}</text></value></field></result>")
            })
            .collect::<String>();
        format!("<results preview='{preview}'><meta><fieldOrder><field>v</field></fieldOrder></meta>{rows}</results>")
    }

    fn source_of(chunks: Vec<String>) -> ByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|x| Ok::<_, TransportError>(Bytes::from(x))),
        )
        .boxed()
    }

    struct Collector {
        events: mpsc::UnboundedSender<String>,
    }

    impl Observer for Collector {
        fn on_next(&mut self, batch: Arc<ResultBatch>) {
            let values = batch
                .records
                .iter()
                .map(|r| r.get("v").flatten().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = self
                .events
                .send(format!("next({},{values})", batch.is_final));
        }

        fn on_error(&mut self, error: ResultsError) {
            let _ = self.events.send(format!("error({error})"));
        }

        fn on_completed(&mut self) {
            let _ = self.events.send("completed".to_string());
        }
    }

    async fn collect_events(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = vec![];
        while let Some(event) = rx.recv().await {
            let done = event == "completed" || event.starts_with("error");
            out.push(event);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn test_preview_stream_delivers_all_batches() {
        let source = source_of(vec![
            document(true, &["a"]),
            document(true, &["a", "b"]),
            document(false, &["a", "b", "c"]),
        ]);
        let stream = ResultStream::new(RetrievalMode::Preview, source, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();
        assert_eq!(
            collect_events(rx).await,
            vec![
                "next(false,a)",
                "next(false,a,b)",
                "next(true,a,b,c)",
                "completed"
            ]
        );
        assert_eq!(stream.field_names().unwrap().fields(), &["v"]);
    }

    #[tokio::test]
    async fn test_results_stream_skips_preview_batches() {
        let source = source_of(vec![document(true, &["a"]), document(false, &["x", "y"])]);
        let stream = ResultStream::new(RetrievalMode::Results, source, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();
        assert_eq!(
            collect_events(rx).await,
            vec!["next(true,x,y)", "completed"]
        );
    }

    #[tokio::test]
    async fn test_results_stream_without_documents() {
        let stream = ResultStream::new(RetrievalMode::Results, source_of(vec![]), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();
        assert_eq!(collect_events(rx).await, vec!["next(true,)", "completed"]);
        assert!(stream.field_names().unwrap().is_empty());

        let source = source_of(vec!["\n".to_string()]);
        let stream = ResultStream::new(RetrievalMode::Preview, source, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();
        assert_eq!(collect_events(rx).await, vec!["completed"]);
    }

    #[tokio::test]
    async fn test_realtime_stream_is_final_only_after_cancellation() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<Bytes, TransportError>>();
        let source = tokio_stream::wrappers::UnboundedReceiverStream::new(chunk_rx).boxed();
        let cancellation = Cancellation::new();
        let stream =
            ResultStream::realtime(RetrievalMode::Preview, source, 4, cancellation.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();

        for value in ["a", "b"] {
            chunk_tx.send(Ok(Bytes::from(document(false, &[value])))).unwrap();
            assert_eq!(rx.recv().await.unwrap(), format!("next(false,{value})"));
        }
        chunk_tx.send(Ok(Bytes::from(document(true, &["c"])))).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "next(false,c)");

        cancellation.cancel();
        chunk_tx.send(Ok(Bytes::from(document(false, &["d"])))).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(false, &["e"])))).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(true, &["f"])))).unwrap();
        drop(chunk_tx);
        assert_eq!(collect_events(rx).await, vec!["next(true,d)", "completed"]);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_batches() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<Bytes, TransportError>>();
        let source = tokio_stream::wrappers::UnboundedReceiverStream::new(chunk_rx).boxed();
        let stream = ResultStream::new(RetrievalMode::Preview, source, 4);

        let (tx1, rx1) = mpsc::unbounded_channel();
        let _first = stream.subscribe(Collector { events: tx1 }).unwrap();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let _second = stream.subscribe(Collector { events: tx2 }).unwrap();

        chunk_tx.send(Ok(Bytes::from(document(true, &["a"])))).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(false, &["b"])))).unwrap();
        drop(chunk_tx);

        let expected = vec!["next(false,a)", "next(true,b)", "completed"];
        assert_eq!(collect_events(rx1).await, expected);
        assert_eq!(collect_events(rx2).await, expected);
    }

    #[tokio::test]
    async fn test_late_subscriber_does_not_receive_earlier_batches() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<Bytes, TransportError>>();
        let source = tokio_stream::wrappers::UnboundedReceiverStream::new(chunk_rx).boxed();
        let stream = ResultStream::new(RetrievalMode::Preview, source, 4);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let _first = stream.subscribe(Collector { events: tx1 }).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(true, &["a"])))).unwrap();
        assert_eq!(rx1.recv().await.unwrap(), "next(false,a)");

        let (tx2, rx2) = mpsc::unbounded_channel();
        let _second = stream.subscribe(Collector { events: tx2 }).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(false, &["b"])))).unwrap();
        drop(chunk_tx);

        assert_eq!(collect_events(rx1).await, vec!["next(true,b)", "completed"]);
        assert_eq!(collect_events(rx2).await, vec!["next(true,b)", "completed"]);
    }

    #[tokio::test]
    async fn test_error_is_delivered_once_to_all_subscribers() {
        let source = stream::iter(vec![
            Ok(Bytes::from(document(true, &["a"]))),
            Err(TransportError::message("connection reset")),
        ])
        .boxed();
        let stream = ResultStream::new(RetrievalMode::Preview, source, 4);
        let (tx1, rx1) = mpsc::unbounded_channel();
        let _first = stream.subscribe(Collector { events: tx1 }).unwrap();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let _second = stream.subscribe(Collector { events: tx2 }).unwrap();

        let first = collect_events(rx1).await;
        assert_eq!(first.last().unwrap(), "error(transport error: connection reset)");
        assert_eq!(first.iter().filter(|x| x.starts_with("error")).count(), 1);
        let second = collect_events(rx2).await;
        assert_eq!(second.last().unwrap(), "error(transport error: connection reset)");

        let (tx3, rx3) = mpsc::unbounded_channel();
        let _third = stream.subscribe(Collector { events: tx3 }).unwrap();
        assert_eq!(
            collect_events(rx3).await,
            vec!["error(transport error: connection reset)"]
        );
    }

    #[tokio::test]
    async fn test_malformed_input_fails_the_stream() {
        let source = source_of(vec!["<results><meta></results>".to_string()]);
        let stream = ResultStream::new(RetrievalMode::Results, source, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = stream.subscribe(Collector { events: tx }).unwrap();
        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("error(malformed record at byte"));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_cancel_last_subscriber_releases_source() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Result<Bytes, TransportError>>();
        let source = tokio_stream::wrappers::UnboundedReceiverStream::new(chunk_rx)
            .map(move |x| {
                let _flag = &flag;
                x
            })
            .boxed();
        let stream = ResultStream::new(RetrievalMode::Preview, source, 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = stream.subscribe(Collector { events: tx }).unwrap();
        chunk_tx.send(Ok(Bytes::from(document(true, &["a"])))).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "next(false,a)");

        stream.cancel(&mut subscription);
        subscription.cancel();
        assert!(!subscription.is_active());
        for _ in 0..100 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(released.load(Ordering::SeqCst));

        // the cancelled subscriber is not completed
        let _ = chunk_tx.send(Ok(Bytes::from(document(false, &["b"]))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_to_sequence_yields_final_records() {
        let source = source_of(vec![
            document(true, &["a"]),
            document(false, &["x", "y", "z"]),
        ]);
        let stream = ResultStream::new(RetrievalMode::Preview, source, 1);
        let records = stream
            .to_sequence()
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        let values = records
            .iter()
            .map(|r| r.get("v").flatten().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(values, vec!["x", "y", "z"]);

        // the source is consumed, so a new sequence is empty
        let again = stream.to_sequence().unwrap().try_collect::<Vec<_>>().await;
        assert_eq!(again.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_events_sequence_yields_all_records() {
        let source = source_of(vec![document(true, &["a"]), document(true, &["b"])]);
        let stream = ResultStream::new(RetrievalMode::Events, source, 1);
        let records = stream
            .to_sequence()
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }
}
