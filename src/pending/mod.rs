use std::sync::{Mutex, MutexGuard};

pub type Renderer<P> = Box<dyn FnMut(P) + Send>;

struct Slot<P> {
    renderer: Option<Renderer<P>>,
    buffered: Option<P>,
    delivered: u64,
}

pub struct PendingRenderQueue<P> {
    slot: Mutex<Slot<P>>,
}

impl<P> Default for PendingRenderQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PendingRenderQueue<P> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                renderer: None,
                buffered: None,
                delivered: 0,
            }),
        }
    }

    /// Renders now if a renderer is registered, else buffers `payload`,
    /// replacing any earlier unconsumed one.
    pub fn offer(&self, payload: P) {
        let mut slot = self.lock();
        match slot.renderer.as_mut() {
            Some(render) => {
                render(payload);
                slot.delivered += 1;
            }
            None => slot.buffered = Some(payload),
        }
    }

    /// The renderer runs under the queue lock and must not call back into it.
    pub fn register_renderer(&self, renderer: Renderer<P>) {
        let mut slot = self.lock();
        slot.renderer = Some(renderer);
        if let Some(payload) = slot.buffered.take() {
            if let Some(render) = slot.renderer.as_mut() {
                render(payload);
            }
            slot.delivered += 1;
        }
    }

    pub fn has_buffered(&self) -> bool {
        self.lock().buffered.is_some()
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    fn lock(&self) -> MutexGuard<'_, Slot<P>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Renderer<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |p| sink.lock().unwrap().push(p)))
    }

    #[test]
    fn buffered_payload_is_drained_once_on_registration() {
        let queue = PendingRenderQueue::new();
        queue.offer(7);
        assert!(queue.has_buffered());

        let (seen, renderer) = recorder();
        queue.register_renderer(renderer);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(!queue.has_buffered());

        let (seen_again, renderer) = recorder();
        queue.register_renderer(renderer);
        assert!(seen_again.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert_eq!(queue.delivered(), 1);
    }

    #[test]
    fn only_the_latest_unconsumed_payload_survives() {
        let queue = PendingRenderQueue::new();
        queue.offer(1);
        queue.offer(2);
        let (seen, renderer) = recorder();
        queue.register_renderer(renderer);
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn offer_after_registration_renders_immediately() {
        let queue = PendingRenderQueue::new();
        let (seen, renderer) = recorder();
        queue.register_renderer(renderer);
        assert!(seen.lock().unwrap().is_empty());

        queue.offer(3);
        queue.offer(4);
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
        assert!(!queue.has_buffered());
    }
}
