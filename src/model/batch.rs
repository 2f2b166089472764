//! 批量识别：逐项隔离失败，结果顺序与提交顺序一致
//!
//! 各项并发执行（上限为 `batch.max_concurrency`），完成后按下标写回预分配的槽位，
//! 汇总计数由结果序列推导，不单独维护。

use crate::model::error::{ErrorKind, OmrError};
use crate::model::recognition::{panic_message, RecognitionGateway, Recognized};
use crate::model::submission::{sanitize_file_name, Submission};
use crate::util::logging::standards::events;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchEntry {
    Success {
        filename: String,
        #[serde(flatten)]
        result: Recognized,
    },
    Error {
        filename: String,
        error: String,
        kind: ErrorKind,
    },
}

impl BatchEntry {
    fn failure(filename: String, err: &OmrError) -> Self {
        BatchEntry::Error {
            filename,
            error: err.to_string(),
            kind: err.kind(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchEntry::Success { .. })
    }

    pub fn filename(&self) -> &str {
        match self {
            BatchEntry::Success { filename, .. } | BatchEntry::Error { filename, .. } => filename,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    total: usize,
    processed: usize,
    failed: usize,
    results: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn new(results: Vec<BatchEntry>) -> Self {
        let processed = results.iter().filter(|entry| entry.is_success()).count();
        Self {
            total: results.len(),
            processed,
            failed: results.len() - processed,
            results,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn results(&self) -> &[BatchEntry] {
        &self.results
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    gateway: RecognitionGateway,
    concurrency: usize,
}

impl BatchOrchestrator {
    pub fn new(gateway: RecognitionGateway, concurrency: usize) -> Self {
        Self {
            gateway,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run_batch(&self, submissions: Vec<Submission>) -> BatchReport {
        let total = submissions.len();
        let started = Instant::now();
        tracing::info!(
            event = events::BATCH_START,
            total,
            concurrency = self.concurrency
        );

        let mut slots: Vec<Option<BatchEntry>> = vec![None; total];
        let mut completed = futures::stream::iter(submissions.into_iter().enumerate())
            .map(|(index, submission)| async move { (index, self.run_item(index, submission).await) })
            .buffer_unordered(self.concurrency);
        while let Some((index, entry)) = completed.next().await {
            slots[index] = Some(entry);
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    BatchEntry::failure(
                        format!("#{}", index),
                        &OmrError::Recognition("item was not processed".to_string()),
                    )
                })
            })
            .collect();
        let report = BatchReport::new(results);
        tracing::info!(
            event = events::BATCH_COMPLETE,
            total = report.total(),
            processed = report.processed(),
            failed = report.failed(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        report
    }

    async fn run_item(&self, index: usize, submission: Submission) -> BatchEntry {
        let declared = submission.declared_name.clone();
        let kind = match submission.admit() {
            Ok(kind) => kind,
            Err(err) => {
                tracing::info!(
                    event = events::SUBMISSION_REJECTED,
                    index,
                    filename = %declared,
                    error = %err
                );
                return BatchEntry::failure(declared, &err);
            }
        };
        let filename = match kind {
            Some(kind) => sanitize_file_name(&declared, kind),
            None => declared.clone(),
        };

        let outcome = AssertUnwindSafe(self.gateway.recognize_submission(submission))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => BatchEntry::Success { filename, result },
            Ok(Err(err)) => {
                tracing::warn!(
                    event = events::BATCH_ITEM_ERROR,
                    index,
                    filename = %declared,
                    kind = ?err.kind(),
                    error = %err
                );
                BatchEntry::failure(declared, &err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    event = events::BATCH_ITEM_PANIC,
                    index,
                    filename = %declared,
                    panic = %message
                );
                BatchEntry::failure(
                    declared,
                    &OmrError::Recognition(format!("unexpected fault: {}", message)),
                )
            }
        }
    }
}
