use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::change::ChangeEvent;

/// 变更通道：分区 → 引擎 owner。
/// 使用 bounded channel 做背压，队列满时丢弃并计数；
/// 一旦发生丢弃，owner 下一次 drain 时必须全量重算（增量标记已不可信）。
pub struct ChangeFeed;

impl ChangeFeed {
    pub fn bounded(capacity: usize) -> (ChangeSender, ChangeReceiver) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        let drops = Arc::new(AtomicU64::new(0));
        (
            ChangeSender {
                tx,
                drops: drops.clone(),
            },
            ChangeReceiver {
                rx,
                drops,
                seen_drops: 0,
            },
        )
    }
}

#[derive(Clone)]
pub struct ChangeSender {
    tx: Sender<ChangeEvent>,
    drops: Arc<AtomicU64>,
}

impl ChangeSender {
    /// 非阻塞发送：队列满（或接收端已关闭）时丢弃并计数
    pub fn publish(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed);
                if drops % 1000 == 0 {
                    tracing::warn!("change feed overflow, total drops: {}", drops + 1);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("change feed receiver dropped, discarding event");
            }
        }
    }

    pub fn overflow_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// 一次 drain 的结果
#[derive(Debug, Default)]
pub struct Drained {
    pub events: Vec<ChangeEvent>,
    /// 自上次 drain 以来是否发生过丢弃
    pub overflowed: bool,
    pub dropped: u64,
}

pub struct ChangeReceiver {
    rx: Receiver<ChangeEvent>,
    drops: Arc<AtomicU64>,
    seen_drops: u64,
}

impl ChangeReceiver {
    pub fn drain(&mut self) -> Drained {
        let events: Vec<ChangeEvent> = self.rx.try_iter().collect();
        let total = self.drops.load(Ordering::Relaxed);
        let dropped = total.saturating_sub(self.seen_drops);
        self.seen_drops = total;
        Drained {
            events,
            overflowed: dropped > 0,
            dropped,
        }
    }

    pub fn overflow_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}
