use crate::core::BrowserEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fans browser events out to every subscriber without dropping any.
///
/// Each subscriber gets its own unbounded queue, so a slow consumer only
/// delays itself. Subscribers whose receiver is gone are pruned on the next
/// emit.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BrowserEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A receiver seeing every event emitted after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BrowserEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: BrowserEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        for _ in 0..500 {
            hub.emit(BrowserEvent::ProcessExited);
        }
        hub.emit(BrowserEvent::Disconnected);

        for rx in [&mut first, &mut second] {
            let mut seen = 0;
            while let Some(event) = rx.recv().await {
                if matches!(event, BrowserEvent::Disconnected) {
                    break;
                }
                seen += 1;
            }
            assert_eq!(seen, 500);
        }
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        hub.emit(BrowserEvent::Disconnected);
        assert_eq!(hub.subscriber_count(), 1);
        drop(kept);
    }
}
