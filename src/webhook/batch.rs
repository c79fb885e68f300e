use serde_json::Value;
use tokio::task::JoinHandle;

/// Pending events for one batched subscription plus its flush timer.
///
/// The events and the timer only change together: taking the events also
/// retires the timer, so a size-triggered and a timer-triggered flush can
/// never both see the same batch.
#[derive(Debug, Default)]
pub(crate) struct BatchQueue {
    events: Vec<Value>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl BatchQueue {
    /// Append and return the new length.
    pub(crate) fn push(&mut self, event: Value) -> usize {
        self.events.push(event);
        self.events.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Replace the flush timer. Returns the generation the new timer must
    /// present to [`take_for_timer`](Self::take_for_timer).
    pub(crate) fn arm(&mut self, spawn: impl FnOnce(u64) -> JoinHandle<()>) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.timer = Some(spawn(self.generation));
        self.generation
    }

    /// Take every event and cancel the timer.
    pub(crate) fn drain(&mut self) -> Vec<Value> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        std::mem::take(&mut self.events)
    }

    /// Timer path: take the events only if `generation` is still current.
    /// The timer handle is released without aborting the calling task.
    pub(crate) fn take_for_timer(&mut self, generation: u64) -> Option<Vec<Value>> {
        if generation != self.generation {
            return None;
        }
        self.timer.take();
        self.generation += 1;
        Some(std::mem::take(&mut self.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn drain_retires_armed_timer() {
        let mut queue = BatchQueue::default();
        queue.push(json!(1));
        let generation = queue.arm(|_| tokio::spawn(std::future::pending()));

        assert_eq!(queue.drain(), vec![json!(1)]);
        assert_eq!(queue.len(), 0);
        assert!(queue.take_for_timer(generation).is_none());
    }

    #[tokio::test]
    async fn rearming_invalidates_older_timer() {
        let mut queue = BatchQueue::default();
        queue.push(json!("a"));
        let first = queue.arm(|_| tokio::spawn(async {}));
        queue.push(json!("b"));
        let second = queue.arm(|_| tokio::spawn(async {}));

        assert!(queue.take_for_timer(first).is_none());
        assert_eq!(
            queue.take_for_timer(second),
            Some(vec![json!("a"), json!("b")])
        );
        assert!(queue.take_for_timer(second).is_none());
    }
}
