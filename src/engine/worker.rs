use arc_swap::ArcSwap;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::{Item, ItemId};
use crate::engine::diff::Edit;
use crate::engine::merge::{recompute, CycleRequest};
use crate::engine::view::ViewState;
use crate::engine::CycleStage;

/// worker → owner 的消息；owner 在自己的任务循环里按序消费
pub(crate) enum WorkerMessage {
    Started {
        generation: u64,
    },
    /// 第一阶段（发布）：新序列与编辑脚本已就绪，worker 随即在屏障上等待
    Ready {
        generation: u64,
        secondary: Arc<Vec<ItemId>>,
        edits: Vec<Edit>,
        failures: usize,
        /// 本周期使用的显式条目快照（owner 据此解析新序列里的显式 id）
        explicit: Arc<Vec<Item>>,
    },
    /// 第三阶段（交换）完成
    Finished {
        generation: u64,
    },
}

/// 互斥锁只保护这一小块握手状态
pub(crate) struct SharedState {
    /// 待处理的请求快照；Some 即 Dirty，多次提交在此合并
    pub request: Option<CycleRequest>,
    /// owner 已应用完编辑的最新周期（第二阶段）
    pub drained: u64,
    pub delete_pending: bool,
    pub stage: CycleStage,
}

pub(crate) struct Shared {
    pub state: Mutex<SharedState>,
    pub wake: Condvar,
    /// 可见序列 + 过渡标记，整体原子替换
    pub view: ArcSwap<ViewState>,
    /// 无锁取消标记：归并循环每步轮询
    pub cancel: AtomicBool,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                request: None,
                drained: 0,
                delete_pending: false,
                stage: CycleStage::Clean,
            }),
            wake: Condvar::new(),
            view: ArcSwap::from_pointee(ViewState::default()),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn set_stage(&self, stage: CycleStage) {
        self.state.lock().stage = stage;
    }

    /// 提交请求：覆盖尚未被取走的旧请求，并合并其 dirty 标记。
    /// 返回是否发生了合并。
    pub fn submit(&self, mut request: CycleRequest) -> bool {
        let mut st = self.state.lock();
        let old = st.request.take();
        let coalesced = old.is_some();
        if let Some(old) = old {
            tracing::debug!(
                "coalescing cycle {} into {}",
                old.generation,
                request.generation
            );
            request.dirty.extend(old.dirty);
        }
        st.request = Some(request);
        if st.stage == CycleStage::Clean {
            st.stage = CycleStage::Dirty;
        }
        self.wake.notify_all();
        coalesced
    }

    /// 第二阶段：owner 应用完第 `generation` 周期的编辑后唤醒 worker
    pub fn mark_drained(&self, generation: u64) {
        let mut st = self.state.lock();
        st.drained = st.drained.max(generation);
        self.wake.notify_all();
    }

    pub fn request_shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.state.lock().delete_pending = true;
        self.wake.notify_all();
    }

    /// worker 退出后复位，以便之后重新拉起
    pub fn reset_after_shutdown(&self) {
        self.cancel.store(false, Ordering::Relaxed);
        let mut st = self.state.lock();
        st.delete_pending = false;
        st.request = None;
        st.stage = CycleStage::Clean;
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    tx: Sender<WorkerMessage>,
    poll: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("content-set-worker".into())
        .spawn(move || {
            tracing::debug!("merge worker started");
            run(&shared, &tx, poll);
            tracing::debug!("merge worker exiting");
        })
}

fn run(shared: &Shared, tx: &Sender<WorkerMessage>, poll: Duration) {
    loop {
        // 持锁取快照，随即释放
        let request = {
            let mut st = shared.state.lock();
            loop {
                if st.delete_pending {
                    return;
                }
                if let Some(r) = st.request.take() {
                    st.stage = CycleStage::Merging;
                    break r;
                }
                shared.wake.wait_for(&mut st, poll);
            }
        };
        let generation = request.generation;
        if tx.send(WorkerMessage::Started { generation }).is_err() {
            return;
        }

        // 昂贵部分：分区查询 + 归并 + 求差，全程不持锁
        let primary = shared.view.load_full().primary.clone();
        let Some(outcome) = recompute(&request, &primary, &shared.cancel, || {
            shared.set_stage(CycleStage::Diffing)
        }) else {
            tracing::debug!("cycle {} cancelled", generation);
            return;
        };

        let secondary = outcome.secondary.clone();
        let ready = WorkerMessage::Ready {
            generation,
            secondary: outcome.secondary,
            edits: outcome.edits,
            failures: outcome.failures,
            explicit: request.explicit.clone(),
        };
        if tx.send(ready).is_err() {
            return;
        }

        // 屏障：等 owner 把本周期编辑全部应用完
        {
            let mut st = shared.state.lock();
            st.stage = CycleStage::Swapping;
            while st.drained < generation {
                if st.delete_pending {
                    return;
                }
                shared.wake.wait_for(&mut st, poll);
            }
        }

        // 交换：secondary 晋升为 primary，标记复位
        let current = shared.view.load_full();
        debug_assert!(current
            .secondary
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &secondary)));
        shared.view.store(Arc::new(current.promote()));
        {
            let mut st = shared.state.lock();
            st.stage = if st.request.is_some() {
                CycleStage::Dirty
            } else {
                CycleStage::Clean
            };
        }
        if tx.send(WorkerMessage::Finished { generation }).is_err() {
            return;
        }
    }
}
