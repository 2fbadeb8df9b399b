use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cancellation flag polled by the interpreter and awaited by builtins.
#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    flag: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let interrupt = Arc::new(Interrupt::default());
        let waiter = tokio::spawn({
            let interrupt = interrupt.clone();
            async move { interrupt.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        interrupt.reset();
        assert!(!interrupt.is_set());
    }
}
