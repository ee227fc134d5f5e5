//! Bounded multi-producer channel of training events.
//!
//! Producers (fold sub-jobs) post `OneDone` when their unit of work finishes; the
//! consumer counts them. `AllDone` from one producer says nothing about the others.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;
use crate::error::{CvError, Result};
use crate::metrics::CV_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingEvent { OneDone, AllDone }

/// Behaviour of `post` when the channel is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Block,
    Reject,
}

pub struct EventChannel;

impl EventChannel {
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (EventSender, EventReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (EventSender { tx, policy, capacity }, EventReceiver { rx, one_done: 0, all_done: 0 })
    }
}

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<TrainingEvent>,
    policy: OverflowPolicy,
    capacity: usize,
}

impl EventSender {
    /// Enqueue `OneDone`; suspends while the channel is full unless the policy is `Reject`.
    pub async fn on_iteration_complete(&self) -> Result<()> { self.post(TrainingEvent::OneDone).await }

    pub async fn on_all_iterations_complete(&self) -> Result<()> { self.post(TrainingEvent::AllDone).await }

    pub async fn post(&self, event: TrainingEvent) -> Result<()> {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(event).await.map_err(|_| CvError::ChannelClosed)?,
            OverflowPolicy::Reject => self.tx.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => {
                    CV_METRICS.events_rejected_total.add(1, &[]);
                    CvError::ChannelOverflow { capacity: self.capacity }
                }
                TrySendError::Closed(_) => CvError::ChannelClosed,
            })?,
        }
        CV_METRICS.events_enqueued_total.add(1, &[]);
        trace!(?event, "event_enqueued");
        Ok(())
    }

    pub fn capacity(&self) -> usize { self.capacity }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<TrainingEvent>,
    one_done: usize,
    all_done: usize,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is dropped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<TrainingEvent> {
        let ev = self.rx.recv().await?;
        self.count(ev);
        Some(ev)
    }

    pub fn try_recv(&mut self) -> Option<TrainingEvent> {
        let ev = self.rx.try_recv().ok()?;
        self.count(ev);
        Some(ev)
    }

    /// Suspends until `expected` `OneDone` events have been observed in total.
    pub async fn await_one_done(&mut self, expected: usize) -> Result<usize> {
        while self.one_done < expected {
            if self.recv().await.is_none() { return Err(CvError::ChannelClosed); }
        }
        Ok(self.one_done)
    }

    /// Drains until an `AllDone` is observed.
    pub async fn await_all_done(&mut self) -> Result<()> {
        let seen = self.all_done;
        while self.all_done == seen {
            if self.recv().await.is_none() { return Err(CvError::ChannelClosed); }
        }
        Ok(())
    }

    pub fn one_done_count(&self) -> usize { self.one_done }
    pub fn all_done_count(&self) -> usize { self.all_done }

    fn count(&mut self, ev: TrainingEvent) {
        match ev {
            TrainingEvent::OneDone => self.one_done += 1,
            TrainingEvent::AllDone => self.all_done += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn counts_events_from_many_producers() {
        let (tx, mut rx) = EventChannel::bounded(2, OverflowPolicy::Block);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 { tx.on_iteration_complete().await.unwrap(); }
                tx.on_all_iterations_complete().await.unwrap();
            }));
        }
        drop(tx);
        while rx.recv().await.is_some() {}
        for t in tasks { t.await.unwrap(); }
        assert_eq!(rx.one_done_count(), 24);
        assert_eq!(rx.all_done_count(), 8);
    }

    #[tokio::test]
    async fn blocks_when_full_instead_of_dropping() {
        let (tx, mut rx) = EventChannel::bounded(1, OverflowPolicy::Block);
        tx.on_iteration_complete().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), tx.on_iteration_complete()).await;
        assert!(blocked.is_err(), "second send should wait for capacity");
        let producer = tokio::spawn(async move { tx.on_iteration_complete().await });
        assert_eq!(rx.await_one_done(2).await.unwrap(), 2);
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reject_policy_reports_overflow() {
        let (tx, _rx) = EventChannel::bounded(1, OverflowPolicy::Reject);
        tx.on_iteration_complete().await.unwrap();
        let err = tx.on_iteration_complete().await.unwrap_err();
        assert!(matches!(err, CvError::ChannelOverflow { capacity: 1 }));
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let (tx, mut rx) = EventChannel::bounded(4, OverflowPolicy::Block);
        tx.on_iteration_complete().await.unwrap();
        drop(tx);
        assert!(matches!(rx.await_one_done(2).await, Err(CvError::ChannelClosed)));
    }
}
