//! Open Harness - 驱动弱本地模型的自驾驶智能体执行引擎
//!
//! 本地小模型是不可靠的工具调用者：JSON 写坏、工具名幻觉、丢上下文、
//! 半途而废。这套引擎负责补偿。模块划分：
//! - **config**: YAML 配置加载（config crate + OH__* 环境变量覆盖）
//! - **core**: 错误分类与目标编排
//! - **llm**: 客户端抽象、OpenAI 兼容 HTTP 实现、回复解析、补偿管线
//! - **context**: 分层上下文存储与 L1/L2 两级压缩
//! - **policy**: 预算、路径与 shell 模式护栏
//! - **checkpoint**: 版本化工作区上的暂存/分支/快照/回滚/合并
//! - **react**: Planner / Critic / 推理执行循环
//! - **tools**: 内置工具集、注册表与执行器（含外部智能体回退）
//! - **tasks**: 持久化后台任务队列与崩溃恢复
//! - **events**: 类型化事件总线（UI 只从这里消费）

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod core;
pub mod events;
pub mod llm;
pub mod observability;
pub mod policy;
pub mod react;
pub mod tasks;
pub mod tools;
