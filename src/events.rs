//! 过程事件总线：解耦主循环与各类前端
//!
//! 类型化发布订阅。每个订阅者持有一个有界缓冲；消费过慢时丢弃最旧事件，
//! 丢弃数量通过 ConsumerLag 事件补发给该订阅者。内部组件只向总线发布，
//! 不持有任何 UI 状态。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::FailureClass;

/// 每个订阅者的缓冲容量（broadcast 环形缓冲，溢出丢最旧）
const SUBSCRIBER_BUFFER: usize = 1024;

/// 主循环生命周期内的全部事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarnessEvent {
    /// 流式输出的一小段 token
    LmTokenChunk { text: String },
    ToolStarted {
        tool: String,
        args_preview: String,
    },
    ToolCompleted {
        tool: String,
        ok: bool,
        elapsed_ms: u64,
    },
    /// 补偿动作：类别 + 采用的策略
    Compensation {
        class: FailureClass,
        strategy: String,
    },
    PlanStepStarted { index: usize, title: String },
    PlanStepCompleted { index: usize, title: String },
    PlanStepFailed {
        index: usize,
        title: String,
        reason: String,
    },
    CheckpointTaken {
        description: String,
        commit: String,
    },
    CheckpointRolledBack { target: String },
    GoalStarted { goal: String },
    GoalCompleted { summary: String },
    GoalFailed { reason: String },
    TaskSubmitted { id: String },
    TaskCompleted { id: String, status: String },
    PolicyViolation { tool: String, rule: String },
    /// 外部智能体限流通知（可见提示 + 冷却时长）
    AgentCooldown { agent: String, cooldown_secs: u64 },
    /// 任务完成时的终端响铃（UI 消费者决定如何呈现）
    TerminalBell,
    /// 订阅者消费滞后，dropped 为被覆盖的事件数
    ConsumerLag { dropped: u64 },
}

/// 事件总线：clone 即共享同一底层通道
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HarnessEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// 发布事件；无订阅者时静默丢弃
    pub fn emit(&self, event: HarnessEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个订阅者的接收端
pub struct EventStream {
    rx: broadcast::Receiver<HarnessEvent>,
}

impl EventStream {
    /// 接收下一个事件。滞后被转换为 ConsumerLag 事件而不是错误，
    /// 通道关闭返回 None。
    pub async fn recv(&mut self) -> Option<HarnessEvent> {
        match self.rx.recv().await {
            Ok(ev) => Some(ev),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some(HarnessEvent::ConsumerLag { dropped: n })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// 非阻塞接收，主要供测试使用
    pub fn try_recv(&mut self) -> Option<HarnessEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Some(HarnessEvent::ConsumerLag { dropped: n })
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(HarnessEvent::GoalStarted {
            goal: "fix tests".into(),
        });

        assert!(matches!(
            a.recv().await,
            Some(HarnessEvent::GoalStarted { .. })
        ));
        assert!(matches!(
            b.recv().await,
            Some(HarnessEvent::GoalStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_emission_order_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.emit(HarnessEvent::LmTokenChunk {
                text: i.to_string(),
            });
        }
        for i in 0..5 {
            match rx.recv().await {
                Some(HarnessEvent::LmTokenChunk { text }) => {
                    assert_eq!(text, i.to_string())
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_lag_surfaces_as_consumer_lag() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        // 超出缓冲容量，最旧事件被覆盖
        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.emit(HarnessEvent::TerminalBell);
        }

        match rx.try_recv() {
            Some(HarnessEvent::ConsumerLag { dropped }) => assert!(dropped >= 10),
            other => panic!("expected ConsumerLag, got {:?}", other),
        }
    }
}
