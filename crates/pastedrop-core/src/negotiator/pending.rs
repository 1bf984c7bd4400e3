//! 单槽缓冲
//!
//! 最多保存一个值，取出即清空。用于在本地 offer 生成之前先到达的 answer。

/// 单槽缓冲，`take` 只会返回一次
#[derive(Debug)]
pub struct PendingSlot<T> {
    slot: Option<T>,
}

impl<T> Default for PendingSlot<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> PendingSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入新值，返回被替换掉的旧值
    pub fn put(&mut self, value: T) -> Option<T> {
        self.slot.replace(value)
    }

    /// 取出并清空
    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
