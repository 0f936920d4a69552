//! A bounded pool of distinct 32-bit tags. Each outstanding request owns exactly one
//! tag; it is released back to the pool once the server's reply bearing that tag has
//! been matched.

use crate::errors::TagStackError;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// LIFO array-backed pool guarded by a mutex. `push` beyond `depth` overflows; `pop`
/// below zero underflows.
pub struct ArrayTagStack {
    inner: Mutex<Vec<u32>>,
    depth: u32,
}

impl ArrayTagStack {
    /// Pre-fills the pool with `0..depth`.
    pub fn new(depth: u32) -> Self {
        Self {
            inner: Mutex::new((0..depth).rev().collect()),
            depth,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn pop(&self) -> Result<u32, TagStackError> {
        self.inner.lock().unwrap().pop().ok_or(TagStackError::Underflow)
    }

    pub fn push(&self, tag: u32) -> Result<(), TagStackError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.len() as u32 >= self.depth {
            return Err(TagStackError::Overflow);
        }
        guard.push(tag);
        Ok(())
    }
}

/// Bounded-channel pool. `pop` blocks until a tag is available; `push` blocks if the
/// channel is full.
pub struct BlockingTagStack {
    tx: mpsc::Sender<u32>,
    rx: Mutex<mpsc::Receiver<u32>>,
    depth: u32,
}

impl BlockingTagStack {
    pub fn new(depth: u32) -> Self {
        let (tx, rx) = mpsc::channel(depth as usize);
        for tag in 0..depth {
            tx.try_send(tag).expect("freshly created channel has room for its own depth");
        }
        Self {
            tx,
            rx: Mutex::new(rx),
            depth,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub async fn pop(&self) -> u32 {
        self.rx
            .lock()
            .unwrap()
            .recv()
            .await
            .expect("the stack owns its own sender for the lifetime of the pool")
    }

    pub async fn push(&self, tag: u32) {
        self.tx.send(tag).await.expect("the stack owns its own receiver for the lifetime of the pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_mode_preserves_tag_multiset() {
        let stack = ArrayTagStack::new(4);
        let a = stack.pop().unwrap();
        let b = stack.pop().unwrap();
        stack.push(a).unwrap();
        let c = stack.pop().unwrap();
        stack.push(b).unwrap();
        stack.push(c).unwrap();
        let mut held = vec![];
        for _ in 0..4 {
            held.push(stack.pop().unwrap());
        }
        held.sort();
        assert_eq!(held, vec![0, 1, 2, 3]);
    }

    #[test]
    fn array_mode_detects_underflow_and_overflow() {
        let stack = ArrayTagStack::new(1);
        let tag = stack.pop().unwrap();
        assert!(matches!(stack.pop(), Err(TagStackError::Underflow)));
        stack.push(tag).unwrap();
        assert!(matches!(stack.push(tag), Err(TagStackError::Overflow)));
    }

    #[tokio::test]
    async fn blocking_mode_roundtrips() {
        let stack = BlockingTagStack::new(2);
        let a = stack.pop().await;
        let b = stack.pop().await;
        stack.push(a).await;
        stack.push(b).await;
        let mut held = vec![stack.pop().await, stack.pop().await];
        held.sort();
        assert_eq!(held, vec![0, 1]);
    }
}
