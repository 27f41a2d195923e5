//! 帧间并行解码的行进度同步.
//!
//! 帧级多线程解码时, B 帧的 direct 模式需要读取下一个参考帧同位宏块的
//! 运动向量与跳过标记. 参考帧解码线程按宏块行发布进度, B 帧解码线程在
//! 读取同位数据前等待对应行完成. 这是帧间唯一的同步点.

use std::sync::{Condvar, Mutex};

/// 按行发布的解码进度计数器
///
/// `publish` 单调递增, `wait_for` 阻塞直到目标行(含)已发布.
/// 解码失败的帧应以 `finish` 发布全部行, 避免等待方永久阻塞.
pub struct RowProgress {
    row: Mutex<i32>,
    cond: Condvar,
}

impl RowProgress {
    pub fn new() -> Self {
        Self {
            row: Mutex::new(-1),
            cond: Condvar::new(),
        }
    }

    /// 发布进度: 第 `row` 行(含)之前的数据均已写入完毕
    pub fn publish(&self, row: i32) {
        let mut cur = self.row.lock().unwrap_or_else(|e| e.into_inner());
        if *cur < row {
            *cur = row;
            self.cond.notify_all();
        }
    }

    /// 标记整帧完成 (含出错提前结束的帧)
    pub fn finish(&self) {
        self.publish(i32::MAX);
    }

    /// 等待第 `row` 行完成
    pub fn wait_for(&self, row: i32) {
        let mut cur = self.row.lock().unwrap_or_else(|e| e.into_inner());
        while *cur < row {
            cur = self.cond.wait(cur).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// 当前已发布的行号 (未发布任何行时为 -1)
    pub fn current(&self) -> i32 {
        *self.row.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RowProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_publish_and_wait() {
        let progress = Arc::new(RowProgress::new());
        assert_eq!(progress.current(), -1);

        let p2 = Arc::clone(&progress);
        let handle = thread::spawn(move || {
            p2.wait_for(3);
            p2.current()
        });

        for row in 0..=3 {
            progress.publish(row);
        }
        assert!(handle.join().unwrap() >= 3);
    }

    #[test]
    fn test_publish_is_monotonic() {
        let progress = RowProgress::new();
        progress.publish(5);
        progress.publish(2);
        assert_eq!(progress.current(), 5);
    }

    #[test]
    fn test_finish_unblocks_all() {
        let progress = Arc::new(RowProgress::new());
        let p2 = Arc::clone(&progress);
        let handle = thread::spawn(move || p2.wait_for(i32::MAX - 1));
        progress.finish();
        handle.join().unwrap();
    }
}
