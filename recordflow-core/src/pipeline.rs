//! Ordered concurrent pipeline. Records are pulled from the input in arrival order, up to `workers`
//! transforms run at the same time, and the results are released strictly in arrival order.
//!
//! The ordering is enforced by a ring of single-permit semaphores ([token_ring]). A worker that is
//! done with index `i` waits on slot `i % workers`; the permit only lands there once `i - 1` has
//! been released, so completion order never leaks into the output and nothing besides the
//! in-flight items has to be buffered.
//!
//! Cancellation: every stage owns a [CancellationToken]. Stage tokens are nested so that cancelling
//! stage `k` (an `Abort`, or the consumer going away) also stops every upstream stage and the
//! ingestion task, while the downstream stages drain what they already received. Cancelling the
//! token handed to [OrderedPipeline::new] stops everything and the consumer gets one terminal
//! [Error::Cancelled](crate::Error::Cancelled) item.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};
use crate::config::pipeline::PipelineConfig;
use crate::message::{StreamItem, TransformResult};

mod stage;
mod token_ring;

use stage::Stage;

/// Transform is applied to every record by the pipeline workers. It is called concurrently from
/// several workers and must hand back an owned value, never a view into shared state.
pub trait Transform<T, U>: Send + Sync + 'static {
    fn transform(
        &self,
        cln_token: CancellationToken,
        record: T,
    ) -> impl Future<Output = TransformResult<U>> + Send;
}

impl<T, U, F, Fut> Transform<T, U> for F
where
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransformResult<U>> + Send,
{
    fn transform(
        &self,
        cln_token: CancellationToken,
        record: T,
    ) -> impl Future<Output = TransformResult<U>> + Send {
        (self)(cln_token, record)
    }
}

type DynTransform<T> =
    dyn Fn(CancellationToken, T) -> BoxFuture<'static, TransformResult<T>> + Send + Sync;

/// BoxedTransform erases the closure type so transforms of different shapes can be chained.
pub struct BoxedTransform<T>(Arc<DynTransform<T>>);

impl<T: Send + 'static> BoxedTransform<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransformResult<T>> + Send + 'static,
    {
        Self(Arc::new(move |cln_token, record| Box::pin(f(cln_token, record))))
    }
}

impl<T> Clone for BoxedTransform<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Send + 'static> Transform<T, T> for BoxedTransform<T> {
    fn transform(
        &self,
        cln_token: CancellationToken,
        record: T,
    ) -> impl Future<Output = TransformResult<T>> + Send {
        (self.0)(cln_token, record)
    }
}

/// OrderedPipeline runs transforms over a stream with bounded parallelism and preserves the arrival
/// order in its output.
#[derive(Clone)]
pub struct OrderedPipeline {
    config: PipelineConfig,
    cln_token: CancellationToken,
}

impl OrderedPipeline {
    pub fn new(config: PipelineConfig, cln_token: CancellationToken) -> Self {
        Self { config, cln_token }
    }

    /// Runs a single transform over `input`. Returns the ordered output and the handle of the
    /// background tasks, which resolves once every worker has exited.
    pub fn run<T, U, S, F>(
        &self,
        input: S,
        transform: F,
    ) -> (ReceiverStream<StreamItem<U>>, JoinHandle<Result<()>>)
    where
        T: Send + 'static,
        U: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
        F: Transform<T, U>,
    {
        let stage_token = self.cln_token.child_token();
        let (ingested, ingest_handle) =
            ingest(input, stage_token.child_token(), self.config.channel_size);

        let stage = self.stage(0, stage_token, true);
        let (output, stage_handle) = stage.spawn(ingested, transform, StreamItem::without_value);

        let handle = tokio::spawn(async move {
            ingest_handle.await??;
            stage_handle.await??;
            Ok::<_, Error>(())
        });

        (ReceiverStream::new(output), handle)
    }

    /// Runs `transforms` back to back, each with its own worker pool and token ring, the next one
    /// reading the ordered output of the previous one. An `Abort` in any stage stops that stage and
    /// all stages before it; the failed record still flows through the remaining stages.
    pub fn run_chain<T, S>(
        &self,
        input: S,
        transforms: Vec<BoxedTransform<T>>,
    ) -> (ReceiverStream<StreamItem<T>>, JoinHandle<Result<()>>)
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        let stages = transforms.len();

        // tokens[k] is a child of tokens[k + 1], so cancelling a stage cancels everything upstream
        let mut tokens = Vec::with_capacity(stages);
        let mut token = self.cln_token.child_token();
        for _ in 0..stages {
            tokens.push(token.clone());
            token = token.child_token();
        }
        tokens.reverse();

        let (mut output, ingest_handle) = ingest(input, token, self.config.channel_size);
        let mut handles = vec![ingest_handle];

        for (id, (transform, stage_token)) in transforms.into_iter().zip(tokens).enumerate() {
            let stage = self.stage(id, stage_token, id + 1 == stages);
            let (next, handle) = stage.spawn(output, transform, std::convert::identity);
            output = next;
            handles.push(handle);
        }
        info!(
            stages,
            workers = self.config.workers,
            policy = %self.config.error_policy,
            "started ordered pipeline"
        );

        let handle = tokio::spawn(async move {
            for handle in handles {
                handle.await??;
            }
            Ok::<_, Error>(())
        });

        (ReceiverStream::new(output), handle)
    }

    fn stage(&self, id: usize, cln_token: CancellationToken, last: bool) -> Stage {
        Stage {
            id,
            workers: self.config.workers,
            error_policy: self.config.error_policy,
            channel_size: self.config.channel_size,
            cln_token,
            emit_cancellation: last,
        }
    }
}

/// Labels every record of `input` with its arrival index.
fn ingest<T, S>(
    input: S,
    cln_token: CancellationToken,
    channel_size: usize,
) -> (mpsc::Receiver<StreamItem<T>>, JoinHandle<Result<()>>)
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_size.max(1));
    let handle = tokio::spawn(async move {
        let mut input = std::pin::pin!(input);
        let mut index: u64 = 0;
        loop {
            let record = tokio::select! {
                biased;
                _ = cln_token.cancelled() => break,
                record = input.next() => record,
            };
            let Some(record) = record else {
                break;
            };

            tokio::select! {
                biased;
                _ = cln_token.cancelled() => break,
                sent = tx.send(StreamItem::ingested(index, record)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            index += 1;
        }
        debug!(records = index, "ingestion stopped");
        Ok(())
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::Rng;

    use super::*;
    use crate::config::ErrorPolicy;
    use crate::message::TransformFailure;

    fn pipeline(workers: usize, policy: ErrorPolicy) -> OrderedPipeline {
        OrderedPipeline::new(
            PipelineConfig::new(workers, policy),
            CancellationToken::new(),
        )
    }

    async fn jitter() {
        let micros = rand::thread_rng().gen_range(0..200);
        tokio::time::sleep(Duration::from_micros(micros)).await;
    }

    async fn collect<T>(stream: ReceiverStream<StreamItem<T>>) -> Vec<StreamItem<T>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_output_keeps_arrival_order() {
        let (output, handle) = pipeline(8, ErrorPolicy::Abort).run(
            tokio_stream::iter(0..1000u64),
            |_cln: CancellationToken, record: u64| async move {
                jitter().await;
                Ok::<_, TransformFailure<String>>(format!("01 - {record}"))
            },
        );

        let items = collect(output).await;
        handle.await.unwrap().unwrap();

        assert_eq!(items.len(), 1000);
        for (expected, item) in items.iter().enumerate() {
            assert_eq!(item.index, expected as u64);
            assert!(item.error.is_none());
            assert_eq!(item.value.as_deref(), Some(format!("01 - {expected}").as_str()));
        }
    }

    #[tokio::test]
    async fn test_parallelism_does_not_change_results() {
        async fn run_with(workers: usize) -> Vec<(u64, Option<u64>, bool)> {
            let (output, handle) = pipeline(workers, ErrorPolicy::Ignore).run(
                tokio_stream::iter(0..200u64),
                |_cln: CancellationToken, record: u64| async move {
                    jitter().await;
                    if record % 17 == 0 {
                        return Err(TransformFailure::with_value(
                            record,
                            Error::Transform("multiple of 17".into()),
                        ));
                    }
                    Ok(record * 3)
                },
            );
            let items = collect(output).await;
            handle.await.unwrap().unwrap();
            items
                .into_iter()
                .map(|item| (item.index, item.value, item.error.is_some()))
                .collect()
        }

        assert_eq!(run_with(1).await, run_with(50).await);
    }

    #[tokio::test]
    async fn test_chain_applies_stages_in_order() {
        let stages = vec![
            BoxedTransform::new(|_cln, r: String| async move { Ok(format!("{r}|01")) }),
            BoxedTransform::new(|_cln, r: String| async move {
                jitter().await;
                assert!(r.ends_with("|01"));
                Ok(format!("{r}|02"))
            }),
        ];

        let (output, handle) = pipeline(2, ErrorPolicy::Abort).run_chain(
            tokio_stream::iter((0..100).map(|i| i.to_string())),
            stages,
        );
        let items = collect(output).await;
        handle.await.unwrap().unwrap();

        assert_eq!(items.len(), 100);
        for (i, item) in items.into_iter().enumerate() {
            assert_eq!(item.index, i as u64);
            assert_eq!(item.value.unwrap(), format!("{i}|01|02"));
        }
    }

    #[tokio::test]
    async fn test_ignore_emits_failed_record_in_place() {
        let stages = vec![
            BoxedTransform::new(|_cln, r: u64| async move {
                jitter().await;
                if r == 50 {
                    return Err(Error::Transform("virtual error".into()).into());
                }
                Ok(r)
            }),
            BoxedTransform::new(|_cln, r: u64| async move {
                // the failed record must not be transformed again
                assert_ne!(r, 50);
                Ok(r)
            }),
        ];

        let (output, handle) =
            pipeline(10, ErrorPolicy::Ignore).run_chain(tokio_stream::iter(0..100u64), stages);
        let items = collect(output).await;
        handle.await.unwrap().unwrap();

        assert_eq!(items.len(), 100);
        let failed: Vec<_> = items.iter().filter(|i| i.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].index, 50);
        assert!(items.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[tokio::test]
    async fn test_drop_removes_failed_record() {
        let (output, handle) = pipeline(10, ErrorPolicy::Drop).run(
            tokio_stream::iter(0..100u64),
            |_cln: CancellationToken, r: u64| async move {
                jitter().await;
                if r == 50 {
                    return Err(Error::Transform("virtual error".into()).into());
                }
                Ok(r)
            },
        );
        let items = collect(output).await;
        handle.await.unwrap().unwrap();

        assert_eq!(items.len(), 99);
        assert!(items.iter().all(|i| !i.is_err()));
        assert!(items.iter().all(|i| i.index != 50));
        assert!(items.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[tokio::test]
    async fn test_abort_stops_after_failed_record() {
        let stages = vec![
            BoxedTransform::new(|_cln, r: u64| async move {
                jitter().await;
                if r == 50 {
                    return Err(Error::Transform("virtual error".into()).into());
                }
                Ok(r)
            }),
            BoxedTransform::new(|_cln, r: u64| async move {
                jitter().await;
                Ok(r)
            }),
        ];

        let (output, handle) =
            pipeline(10, ErrorPolicy::Abort).run_chain(tokio_stream::iter(0..100u64), stages);
        let items = collect(output).await;
        handle.await.unwrap().unwrap();

        assert_eq!(items.len(), 51);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i as u64);
            assert_eq!(item.is_err(), i == 50);
        }
    }

    #[tokio::test]
    async fn test_external_cancellation_reports_once() {
        let cln_token = CancellationToken::new();
        let pipeline = OrderedPipeline::new(
            PipelineConfig::new(5, ErrorPolicy::Ignore),
            cln_token.clone(),
        );

        let (output, handle) = pipeline.run(
            tokio_stream::iter(0..10u64),
            |cln: CancellationToken, r: u64| async move {
                tokio::select! {
                    _ = cln.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        panic!("cancellation not observed")
                    }
                }
                Ok(r)
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        cln_token.cancel();

        let items = tokio::time::timeout(Duration::from_secs(2), collect(output))
            .await
            .expect("pipeline did not tear down");
        handle.await.unwrap().unwrap();

        let cancelled: Vec<_> = items
            .iter()
            .filter(|i| i.error == Some(Error::Cancelled))
            .collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(items.last().unwrap().error, Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_upstream() {
        let (mut output, handle) = pipeline(4, ErrorPolicy::Ignore).run(
            tokio_stream::iter(0..),
            |_cln: CancellationToken, r: u64| async move { Ok(r) },
        );
        assert_eq!(output.next().await.unwrap().index, 0);
        drop(output);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("workers leaked after consumer went away")
            .unwrap()
            .unwrap();
    }

    /// Three chained stages add 1, 2 and 3. The record whose second stage yields 33 fails there.
    #[tokio::test]
    async fn test_multiple_stages_per_policy() {
        let cases = [
            (ErrorPolicy::Abort, 30 + 1 + 2, true, 3),
            (ErrorPolicy::Ignore, 50 + 1 + 2 + 3, false, 5),
            (ErrorPolicy::Drop, 50 + 1 + 2 + 3, false, 4),
        ];

        for (policy, last_value, last_failed, emitted) in cases {
            let stages = vec![
                BoxedTransform::new(|_cln, r: i64| async move { fail_at(r + 1, 33) }),
                BoxedTransform::new(|_cln, r: i64| async move { fail_at(r + 2, 33) }),
                BoxedTransform::new(|_cln, r: i64| async move {
                    assert_ne!(r, 33, "a failed record must not reach a later transform");
                    Ok(r + 3)
                }),
            ];

            let (output, handle) = pipeline(5, policy)
                .run_chain(tokio_stream::iter(vec![10, 20, 30, 40, 50]), stages);
            let items = collect(output).await;
            handle.await.unwrap().unwrap();

            assert_eq!(items.len(), emitted, "{policy}");
            let last = items.last().unwrap();
            assert_eq!(last.value, Some(last_value), "{policy}");
            assert_eq!(last.is_err(), last_failed, "{policy}");
        }
    }

    fn fail_at(value: i64, failing: i64) -> TransformResult<i64> {
        if value == failing {
            return Err(TransformFailure::with_value(
                value,
                Error::Transform("some error".into()),
            ));
        }
        Ok(value)
    }
}
