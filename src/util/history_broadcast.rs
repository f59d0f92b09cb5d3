use {
    std::{
        cmp::min,
        collections::VecDeque,
        sync::{Arc, RwLock},
    },
    tokio::sync::Notify,
};

/*
    Broadcast channel that keeps the last `capacity` values around, so a subscriber
can ask for some of the history when it joins. Used for machine events: a late
observer still sees the recent traffic.
*/
struct HistoryRingBufferInner<T> {
    storage: VecDeque<T>,
    // Sequence number of storage[0].
    begin_count: usize,
    closed: bool,
}
impl<T> HistoryRingBufferInner<T> {
    fn end_count(&self) -> usize {
        self.begin_count + self.storage.len()
    }
}
struct HistoryRingBuffer<T> {
    inner: RwLock<HistoryRingBufferInner<T>>,
    capacity: usize,
    on_next: Notify,
}
pub struct Sender<T> {
    state: Arc<HistoryRingBuffer<T>>,
}
#[derive(Clone)]
pub struct Receiver<T> {
    next_count: usize,
    state: Arc<HistoryRingBuffer<T>>,
}
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReceiverError {
    Lagged(usize),
    Closed,
}
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryReceiverError {
    Empty,
    Lagged(usize),
    Closed,
}

fn subscribe_with_history_count_impl<T>(
    history: Arc<HistoryRingBuffer<T>>,
    size: usize,
) -> Receiver<T> {
    let end_count = match history.inner.read() {
        Ok(lock) => lock.end_count(),
        Err(poisoned) => poisoned.into_inner().end_count(),
    };
    let next_count = end_count - min(end_count, size);
    Receiver {
        next_count,
        state: history,
    }
}

impl<T: Clone + Send + Sync> Sender<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history broadcast needs room for one value");
        Sender {
            state: Arc::new(HistoryRingBuffer {
                inner: RwLock::new(HistoryRingBufferInner {
                    storage: VecDeque::with_capacity(capacity),
                    begin_count: 0,
                    closed: false,
                }),
                capacity,
                on_next: Notify::new(),
            }),
        }
    }
    pub fn send(&self, value: T) {
        let history = &*self.state;
        {
            let mut lock = match history.inner.write() {
                Ok(lock) => lock,
                Err(poisoned) => poisoned.into_inner(),
            };
            if lock.storage.len() == history.capacity {
                lock.storage.pop_front();
                lock.begin_count += 1;
            }
            lock.storage.push_back(value);
        }
        history.on_next.notify_waiters();
    }
    pub fn subscribe_with_history_count(&self, size: usize) -> Receiver<T> {
        subscribe_with_history_count_impl(self.state.clone(), size)
    }
}
impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        match self.state.inner.write() {
            Ok(mut lock) => lock.closed = true,
            Err(poisoned) => poisoned.into_inner().closed = true,
        }
        self.state.on_next.notify_waiters();
    }
}
impl<T: Clone + Send + Sync> Receiver<T> {
    pub fn try_recv(&mut self) -> Result<T, TryReceiverError> {
        let history = &*self.state;
        let lock = match history.inner.read() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lock.begin_count > self.next_count {
            let difference = lock.begin_count - self.next_count;
            self.next_count = lock.begin_count;
            Err(TryReceiverError::Lagged(difference))
        } else if self.next_count >= lock.end_count() {
            if lock.closed {
                Err(TryReceiverError::Closed)
            } else {
                Err(TryReceiverError::Empty)
            }
        } else {
            let value = lock.storage[self.next_count - lock.begin_count].clone();
            self.next_count += 1;
            Ok(value)
        }
    }
    pub async fn recv(&mut self) -> Result<T, ReceiverError> {
        loop {
            // Register interest before checking, so a send in between is not missed.
            let state = self.state.clone();
            let notified = state.on_next.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryReceiverError::Closed) => return Err(ReceiverError::Closed),
                Err(TryReceiverError::Lagged(amount)) => return Err(ReceiverError::Lagged(amount)),
                Err(TryReceiverError::Empty) => notified.await,
            }
        }
    }
    pub fn subscribe_with_history_count(&self, size: usize) -> Receiver<T> {
        subscribe_with_history_count_impl(self.state.clone(), size)
    }
}
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_history_buffer() {
        let sender = Sender::<u64>::new(4);
        let mut receiver = sender.subscribe_with_history_count(10);
        let mut receiver_2 = sender.subscribe_with_history_count(10);
        assert_eq!(receiver.try_recv(), Err(TryReceiverError::Empty));
        assert_eq!(receiver_2.try_recv(), Err(TryReceiverError::Empty));
        for i in 0..16 {
            sender.send(i);
            assert_eq!(receiver.try_recv(), Ok(i));
            assert_eq!(receiver.try_recv(), Err(TryReceiverError::Empty));
        }
        assert_eq!(receiver_2.try_recv(), Err(TryReceiverError::Lagged(12)));
        for i in 12..16 {
            assert_eq!(receiver_2.try_recv(), Ok(i));
        }

        let mut receiver_3 = sender.subscribe_with_history_count(2);
        for i in 14..16 {
            assert_eq!(receiver_3.try_recv(), Ok(i));
        }
    }

    #[test]
    fn test_closed_after_drain() {
        let sender = Sender::<u8>::new(2);
        let mut receiver = sender.subscribe_with_history_count(0);
        sender.send(7);
        drop(sender);
        assert_eq!(receiver.try_recv(), Ok(7));
        assert_eq!(receiver.try_recv(), Err(TryReceiverError::Closed));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let sender = Sender::<u32>::new(8);
        let mut receiver = sender.subscribe_with_history_count(0);
        let task = tokio::spawn(async move { receiver.recv().await });
        tokio::task::yield_now().await;
        sender.send(3);
        assert_eq!(task.await.unwrap(), Ok(3));
    }

    #[test]
    fn test_send() {
        fn is_send<T: Send>() {}
        is_send::<Receiver<u8>>();
        is_send::<Sender<u8>>();
    }
}
